// MIT License - Copyright (c) 2026 Peter Wright

pub mod primary;
pub mod secondary;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Which channel a send went over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Datagram: fast, lossy, fire-and-forget.
    Primary,
    /// Connection-oriented: slow, narrowband, engaged only when the
    /// primary is judged unavailable.
    Secondary,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// The byte stream of an answered outbound session.
///
/// The host's line-signaling layer produces these; in tests an in-memory
/// duplex stream stands in.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// The "place an outbound call-like session" primitive, provided by the host.
///
/// `dial` resolves once the far side has answered and the stream is ready
/// for the synchronization handshake. Establishing a session may take
/// seconds; callers must not hold the event-queue lock across it.
#[allow(async_fn_in_trait)]
pub trait Dialer: Send + Sync {
    type Stream: SessionStream;

    async fn dial(&self) -> Result<Self::Stream>;
}
