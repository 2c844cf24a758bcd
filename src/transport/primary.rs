// MIT License - Copyright (c) 2026 Peter Wright

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{AlarmError, Result};

/// Largest frame either side will accept off the datagram socket.
pub const MAX_DATAGRAM: usize = 512;

/// The client's end of the datagram channel.
///
/// Sending is fire-and-forget: a successful send says nothing about
/// delivery, and a failed one is reported so the caller can mark
/// connectivity lost, never propagated further. Only a received
/// acknowledgment updates connectivity state.
pub struct PrimaryTransport {
    socket: UdpSocket,
}

impl PrimaryTransport {
    /// Bind a local socket and aim it at the server.
    pub async fn connect(bind_addr: &str, server_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        debug!(server = server_addr, "primary transport ready");
        Ok(Self { socket })
    }

    /// Fire one frame at the server. Returns whether the local send
    /// succeeded; the frame may still be silently dropped in flight.
    pub async fn send(&self, frame: &str) -> bool {
        match self.socket.send(frame.as_bytes()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("primary send failed: {e}");
                false
            }
        }
    }

    /// Wait for the next datagram from the server (acknowledgments).
    pub async fn recv(&self) -> Result<String> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        String::from_utf8(buf[..n].to_vec()).map_err(|_| AlarmError::MalformedMessage {
            details: "non-ascii datagram".to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
