// MIT License - Copyright (c) 2026 Peter Wright

// Central-station daemon: runs the server agent and/or local client agents
// from a TOML configuration file.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

use alarm_station::{
    AgentEvent, ClientAgent, ClientConfig, Server, ServerConfig, TcpDialer,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "alarm-station")]
#[command(about = "Alarm event reporting daemon: central station and client agents")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    server: Option<ServerToml>,
    #[serde(default, rename = "client")]
    clients: Vec<ClientToml>,
}

#[derive(Debug, Deserialize)]
struct ServerToml {
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
    /// Endpoint answering inbound secondary sessions.
    #[serde(default = "default_session_listen_addr")]
    session_listen_addr: String,
    #[serde(default = "default_ip_loss_tolerance")]
    ip_loss_tolerance: u64,
    #[serde(default, rename = "client")]
    clients: Vec<RegisteredToml>,
}

#[derive(Debug, Deserialize)]
struct RegisteredToml {
    id: String,
    pin: String,
    #[serde(default = "default_egress_delay")]
    egress_delay: u64,
}

#[derive(Debug, Deserialize)]
struct ClientToml {
    id: String,
    pin: String,
    server_addr: String,
    /// Endpoint the secondary session dials.
    session_addr: String,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_ping_interval")]
    ping_interval: u64,
    #[serde(default = "default_egress_delay")]
    egress_delay: u64,
    #[serde(default = "default_secondary_grace")]
    secondary_grace: u64,
    #[serde(default, rename = "sensor")]
    sensors: Vec<SensorToml>,
}

#[derive(Debug, Deserialize)]
struct SensorToml {
    id: u32,
    #[serde(default)]
    disarm_delay: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7580".to_string()
}
fn default_session_listen_addr() -> String {
    "0.0.0.0:7581".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}
fn default_ip_loss_tolerance() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    10
}
fn default_egress_delay() -> u64 {
    15
}
fn default_secondary_grace() -> u64 {
    5
}

fn build_server_config(toml: &ServerToml) -> ServerConfig {
    let mut builder = ServerConfig::builder()
        .listen_addr(&toml.listen_addr)
        .ip_loss_tolerance(toml.ip_loss_tolerance);
    for client in &toml.clients {
        builder = builder.client(&client.id, &client.pin, client.egress_delay);
    }
    builder.build()
}

fn build_client_config(toml: &ClientToml) -> ClientConfig {
    let mut builder = ClientConfig::builder()
        .client_id(&toml.id)
        .pin(&toml.pin)
        .server_addr(&toml.server_addr)
        .bind_addr(&toml.bind_addr)
        .ping_interval(toml.ping_interval)
        .egress_delay(toml.egress_delay)
        .secondary_grace(toml.secondary_grace);
    for sensor in &toml.sensors {
        builder = builder.sensor(sensor.id, sensor.disarm_delay);
    }
    builder.build()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=alarm_station=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let config_text =
        std::fs::read_to_string(&cli.config).context("Failed to read config file")?;
    let config: Config = toml::from_str(&config_text).context("Failed to parse config file")?;

    if config.server.is_none() && config.clients.is_empty() {
        anyhow::bail!("config defines neither a [server] section nor any [[client]]");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if let Some(server_toml) = &config.server {
        let server = Arc::new(Server::new(build_server_config(server_toml)));

        // Operator-visible log of everything the station applies or infers.
        let mut events = server.subscribe();
        let mut log_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = log_shutdown.changed() => {
                        if *log_shutdown.borrow() {
                            break;
                        }
                    }
                    received = events.recv() => match received {
                        Ok(AgentEvent::Applied { client_id, event }) => {
                            info!(
                                client_id = %client_id,
                                kind = event.kind.description(),
                                sensor = ?event.sensor,
                                "station: event"
                            );
                        }
                        Ok(AgentEvent::Inferred { client_id, kind }) => {
                            warn!(client_id = %client_id, kind = kind.description(), "station: inferred");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("event log lagged, missed {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }));

        // Inbound secondary sessions (the answering side of the fallback
        // channel) arrive over TCP in this host integration.
        let listener = TcpListener::bind(&server_toml.session_listen_addr)
            .await
            .context("Failed to bind secondary session listener")?;
        info!(listen = %server_toml.session_listen_addr, "answering secondary sessions");
        let answering = server.clone();
        let mut listener_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener_shutdown.changed() => {
                        if *listener_shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let server = answering.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = server.answer(stream).await {
                                        warn!("secondary session from {peer} ended with error: {e}");
                                    }
                                });
                            }
                            Err(e) => warn!("session accept failed: {e}"),
                        }
                    }
                }
            }
        }));

        let runner = server.clone();
        let server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = runner.run(server_shutdown).await {
                error!("server terminated: {e}");
            }
        }));
    }

    for client_toml in &config.clients {
        let dialer = TcpDialer::new(&client_toml.session_addr);
        let agent = Arc::new(
            ClientAgent::connect(build_client_config(client_toml), dialer)
                .await
                .with_context(|| format!("Failed to start client {}", client_toml.id))?,
        );
        let client_shutdown = shutdown_rx.clone();
        let id = client_toml.id.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = agent.run(client_shutdown).await {
                error!("client {id} terminated: {e}");
            }
        }));
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    info!("alarm-station running. SIGINT/SIGTERM to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}
