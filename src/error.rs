// MIT License - Copyright (c) 2026 Peter Wright

use std::fmt;

/// Outcome of applying a received message to a client's sequencing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// In-sequence message, state applied, `next_expected` advanced.
    Applied,
    /// Sequence below `next_expected`: a replay. Acknowledged again, not reapplied.
    AlreadyApplied,
    /// Sequence above `next_expected`: a gap. Rejected, no acknowledgment.
    Rejected,
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already applied",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// All errors that can occur in the alarm-station library.
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire frame that cannot be decoded. The caller drops the message and
    /// logs a warning; this is never retried and never answered.
    #[error("malformed message: {details}")]
    MalformedMessage { details: String },

    /// Unknown client id or pin mismatch. Silent on the network.
    #[error("authentication failed for client {client_id}")]
    AuthenticationFailed { client_id: String },

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("unknown sensor: {id}")]
    UnknownSensor { id: u32 },

    /// The secondary session peer did not produce an expected frame in time.
    #[error("session timeout while waiting for {waiting_for}")]
    SessionTimeout { waiting_for: &'static str },

    /// The secondary session stream closed mid-handshake.
    #[error("session closed by peer")]
    SessionClosed,

    #[error("transport disconnected")]
    Disconnected,

    #[error("channel closed")]
    ChannelClosed,
}

impl AlarmError {
    /// Whether the failure is transient and the operation should be retried
    /// on the next wake-up or retransmit pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AlarmError::Io(_)
                | AlarmError::SessionTimeout { .. }
                | AlarmError::SessionClosed
                | AlarmError::Disconnected
                | AlarmError::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, AlarmError>;
