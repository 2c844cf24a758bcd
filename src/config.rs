// MIT License - Copyright (c) 2026 Peter Wright

/// Per-sensor configuration values.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub id: u32,
    /// Seconds allowed between a trigger and a disarm. 0 = never alarms.
    pub disarm_delay: u64,
}

/// Configuration for one client agent.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub pin: String,
    /// Server's datagram endpoint, e.g. "127.0.0.1:7580".
    pub server_addr: String,
    /// Local datagram bind address.
    pub bind_addr: String,
    /// Keep-alive interval in seconds.
    pub ping_interval: u64,
    /// Egress grace window in seconds after a temporary disarm.
    pub egress_delay: u64,
    /// Seconds a secondary session idles in case another event needs to go
    /// out before it is torn down.
    pub secondary_grace: u64,
    pub sensors: Vec<SensorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "client1".to_string(),
            pin: "1234".to_string(),
            server_addr: "127.0.0.1:7580".to_string(),
            bind_addr: "0.0.0.0:0".to_string(),
            ping_interval: 10,
            egress_delay: 15,
            secondary_grace: 5,
            sensors: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    pub fn pin(mut self, pin: impl Into<String>) -> Self {
        self.config.pin = pin.into();
        self
    }

    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn ping_interval(mut self, secs: u64) -> Self {
        self.config.ping_interval = secs;
        self
    }

    pub fn egress_delay(mut self, secs: u64) -> Self {
        self.config.egress_delay = secs;
        self
    }

    pub fn secondary_grace(mut self, secs: u64) -> Self {
        self.config.secondary_grace = secs;
        self
    }

    pub fn sensor(mut self, id: u32, disarm_delay: u64) -> Self {
        self.config.sensors.push(SensorConfig { id, disarm_delay });
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// A client the server is willing to talk to.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    pub pin: String,
    /// Mirrored egress window for the server-side state machine.
    pub egress_delay: u64,
}

/// Configuration for the server agent.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Datagram listen endpoint.
    pub listen_addr: String,
    /// Seconds of silence before a client is declared disconnected.
    pub ip_loss_tolerance: u64,
    pub clients: Vec<RegisteredClient>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7580".to_string(),
            ip_loss_tolerance: 60,
            clients: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn ip_loss_tolerance(mut self, secs: u64) -> Self {
        self.config.ip_loss_tolerance = secs;
        self
    }

    pub fn client(
        mut self,
        client_id: impl Into<String>,
        pin: impl Into<String>,
        egress_delay: u64,
    ) -> Self {
        self.config.clients.push(RegisteredClient {
            client_id: client_id.into(),
            pin: pin.into(),
            egress_delay,
        });
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::builder()
            .client_id("club")
            .pin("4567")
            .server_addr("10.0.0.1:7580")
            .ping_interval(5)
            .egress_delay(20)
            .sensor(1, 30)
            .sensor(2, 0)
            .build();

        assert_eq!(config.client_id, "club");
        assert_eq!(config.pin, "4567");
        assert_eq!(config.server_addr, "10.0.0.1:7580");
        assert_eq!(config.ping_interval, 5);
        assert_eq!(config.egress_delay, 20);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[1].disarm_delay, 0);
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::builder().build();
        assert_eq!(config.ping_interval, 10);
        assert_eq!(config.egress_delay, 15);
        assert_eq!(config.secondary_grace, 5);
        assert_eq!(config.bind_addr, "0.0.0.0:0");
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::builder()
            .listen_addr("0.0.0.0:9000")
            .ip_loss_tolerance(45)
            .client("club", "1234", 15)
            .build();

        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.ip_loss_tolerance, 45);
        assert_eq!(config.clients.len(), 1);
        assert_eq!(config.clients[0].client_id, "club");
    }
}
