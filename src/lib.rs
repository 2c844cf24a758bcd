// MIT License - Copyright (c) 2026 Peter Wright

//! # alarm-station
//!
//! Event reporting between distributed alarm sensor agents and a central
//! station, over a fast lossy datagram channel with automatic failover to a
//! slow connection-oriented secondary channel, with a locally enforced
//! disarm/breach timing policy.
//!
//! Each client agent owns its sensors, a sequenced at-least-once delivery
//! queue and both transports; the server authenticates clients, enforces
//! sequencing, mirrors each client's alarm state and infers from elapsed
//! time the events a client could never send (breach, connectivity loss).
//!
//! ## Quick Start
//!
//! ```no_run
//! use alarm_station::{ClientAgent, ClientConfig, TcpDialer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::builder()
//!         .client_id("club")
//!         .pin("1234")
//!         .server_addr("192.168.0.10:7580")
//!         .sensor(1, 30)
//!         .sensor(2, 0)
//!         .build();
//!
//!     let dialer = TcpDialer::new("192.168.0.10:7581");
//!     let agent = std::sync::Arc::new(ClientAgent::connect(config, dialer).await?);
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let runner = agent.clone();
//!     tokio::spawn(async move { runner.run(shutdown_rx).await });
//!
//!     agent.trigger_sensor(1).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     let _ = shutdown_tx.send(true);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod queue;
pub mod sensor;
pub mod server;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use client::ClientAgent;
pub use codec::WireMessage;
pub use config::{
    ClientConfig, ClientConfigBuilder, RegisteredClient, SensorConfig, ServerConfig,
    ServerConfigBuilder,
};
pub use error::{AlarmError, ProcessOutcome, Result};
pub use event::{AgentEvent, Event, EventKind, EventReceiver, HookContext, HookRegistry};
pub use queue::DeliveryQueue;
pub use sensor::Sensor;
pub use server::{ClientSnapshot, Server};
pub use state::{AlarmMachine, AlarmState};
pub use transport::secondary::TcpDialer;
pub use transport::{Dialer, SessionStream, TransportKind};
