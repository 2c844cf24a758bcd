// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;

/// Event types carried on the wire and inferred locally.
///
/// The discriminant is the wire integer. BREACH, CONNECTIVITY_LOST,
/// CONNECTIVITY_RESTORED and PING never consume a sequence number: both
/// sides derive the first three independently from elapsed time, and PING
/// bypasses the delivery queue entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Sensor/system nominal.
    Ok = 0,
    /// A sensor went active. Payload carries the absolute breach deadline
    /// (epoch seconds) when the trigger has an alarm consequence.
    Triggered = 1,
    /// A sensor returned to rest.
    Restored = 2,
    /// Disarm request honored.
    Disarmed = 3,
    /// Temporary disarm for egress; opens the egress grace window.
    TempDisarmed = 4,
    /// Breach deadline elapsed without a disarm. Inferred, never transmitted.
    Breach = 5,
    /// No contact within tolerance. Inferred, never transmitted.
    ConnectivityLost = 6,
    /// Contact re-established. Inferred, never transmitted.
    ConnectivityRestored = 7,
    /// Keep-alive probe. Sent immediately, never queued, never sequenced.
    Ping = 8,
}

impl EventKind {
    /// Parse the wire integer.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Triggered),
            2 => Some(Self::Restored),
            3 => Some(Self::Disarmed),
            4 => Some(Self::TempDisarmed),
            5 => Some(Self::Breach),
            6 => Some(Self::ConnectivityLost),
            7 => Some(Self::ConnectivityRestored),
            8 => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a transmitted event of this kind consumes a sequence number.
    pub fn consumes_sequence(self) -> bool {
        !matches!(
            self,
            Self::Breach | Self::ConnectivityLost | Self::ConnectivityRestored | Self::Ping
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Triggered => "triggered",
            Self::Restored => "restored",
            Self::Disarmed => "disarmed",
            Self::TempDisarmed => "temporarily disarmed",
            Self::Breach => "breach",
            Self::ConnectivityLost => "connectivity lost",
            Self::ConnectivityRestored => "connectivity restored",
            Self::Ping => "ping",
        }
    }
}

/// One reporting event. Immutable once created; the sequence number is
/// assigned by the delivery queue at enqueue time and stays 0 for kinds
/// that are never transmitted or acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub sequence: u64,
    /// Minute:second wall-clock stamp taken at creation. Empty for PING.
    pub timestamp: String,
    pub sensor: Option<u32>,
    pub payload: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, sensor: Option<u32>, payload: Option<String>) -> Self {
        Self {
            kind,
            sequence: 0,
            timestamp: wall_stamp(),
            sensor,
            payload,
        }
    }

    /// A keep-alive probe: empty sequence and timestamp positions on the wire.
    pub fn ping() -> Self {
        Self {
            kind: EventKind::Ping,
            sequence: 0,
            timestamp: String::new(),
            sensor: None,
            payload: None,
        }
    }
}

/// Minute:second stamp for wire timestamps.
pub fn wall_stamp() -> String {
    Local::now().format("%M:%S").to_string()
}

/// Current unix time in whole seconds. All timing policy in the crate takes
/// `now` explicitly; the run loops source it from here.
pub fn epoch_secs() -> u64 {
    Local::now().timestamp().max(0) as u64
}

/// Notifications emitted by the agents for host consumption.
///
/// Hosts subscribe via `Server::subscribe()` / `ClientAgent::subscribe()`
/// and receive a `tokio::sync::broadcast::Receiver<AgentEvent>`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The server applied a transmitted event to its mirrored state.
    Applied { client_id: String, event: Event },
    /// An event was inferred from elapsed time or observed silence
    /// (breach, connectivity lost/restored), on either side.
    Inferred { client_id: String, kind: EventKind },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<AgentEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<AgentEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

/// Context handed to an execution hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub kind: EventKind,
    pub client_id: String,
    pub sensor: Option<u32>,
}

/// A dialplan-style execution hook. Invoked synchronously; the host decides
/// whether to hand off to its own task from inside the callback.
pub type Hook = Arc<dyn Fn(&HookContext) + Send + Sync>;

/// Registry of execution hooks keyed by event kind.
///
/// The server fires hooks when it applies or infers an event; the client
/// fires them when a breach or connectivity transition happens locally.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<EventKind, Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook for an event kind, replacing any previous one.
    pub fn on<F>(&mut self, kind: EventKind, hook: F)
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.hooks.insert(kind, Arc::new(hook));
    }

    /// Fire the hook for the context's kind, if one is installed.
    pub fn fire(&self, ctx: &HookContext) {
        if let Some(hook) = self.hooks.get(&ctx.kind) {
            hook(ctx);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("kinds", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_kind_wire_roundtrip() {
        for v in 0..=8u8 {
            let kind = EventKind::from_u8(v).unwrap();
            assert_eq!(kind.as_u8(), v);
        }
        assert!(EventKind::from_u8(9).is_none());
    }

    #[test]
    fn test_sequence_consumption() {
        assert!(EventKind::Triggered.consumes_sequence());
        assert!(EventKind::Restored.consumes_sequence());
        assert!(EventKind::Disarmed.consumes_sequence());
        assert!(EventKind::TempDisarmed.consumes_sequence());
        assert!(EventKind::Ok.consumes_sequence());
        assert!(!EventKind::Ping.consumes_sequence());
        assert!(!EventKind::Breach.consumes_sequence());
        assert!(!EventKind::ConnectivityLost.consumes_sequence());
        assert!(!EventKind::ConnectivityRestored.consumes_sequence());
    }

    #[test]
    fn test_ping_has_empty_stamp() {
        let ping = Event::ping();
        assert!(ping.timestamp.is_empty());
        assert_eq!(ping.sequence, 0);

        let trig = Event::new(EventKind::Triggered, Some(3), None);
        assert!(!trig.timestamp.is_empty());
    }

    #[test]
    fn test_hooks_fire_by_kind() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut hooks = HookRegistry::new();
        let counter = fired.clone();
        hooks.on(EventKind::Breach, move |ctx| {
            assert_eq!(ctx.client_id, "c1");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = HookContext {
            kind: EventKind::Breach,
            client_id: "c1".to_string(),
            sensor: None,
        };
        hooks.fire(&ctx);
        hooks.fire(&ctx);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // No hook registered for this kind
        hooks.fire(&HookContext {
            kind: EventKind::Disarmed,
            client_id: "c1".to_string(),
            sensor: None,
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
