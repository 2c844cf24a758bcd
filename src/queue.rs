// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::event::Event;

/// Attempt count at which a stuck event is called out in the log.
const RETRY_WARN_THRESHOLD: u32 = 10;

/// A queued event plus its delivery bookkeeping. Owned exclusively by one
/// client's queue; destroyed when the server's cumulative ack covers it.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: Event,
    pub attempts: u32,
}

struct QueueInner {
    /// Monotonic counter; the next sequence number to hand out. Starts at 1.
    next_sequence: u64,
    /// FIFO by sequence number; insertion is tail-only.
    events: VecDeque<OutboundEvent>,
}

/// Per-client FIFO of outbound events with at-least-once delivery.
///
/// Sequence assignment, enqueue and purge are serialized under one mutex;
/// sending never happens under it: retransmission takes an ordered snapshot
/// so the slow secondary transport can drain it without blocking enqueues.
/// The `Notify` wake is the sender task's wake-up signal.
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    wake: Notify,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_sequence: 1,
                events: VecDeque::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Assign the next sequence number, append to the tail and wake the
    /// sender. Returns the assigned sequence.
    ///
    /// Kinds that never consume a sequence number (PING, the inferred types)
    /// are refused: PING bypasses the queue and the rest are never
    /// transmitted at all.
    pub async fn enqueue(&self, mut event: Event) -> u64 {
        if !event.kind.consumes_sequence() {
            warn!(kind = event.kind.description(), "refusing to queue unsequenced event kind");
            return 0;
        }
        let seq = {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_sequence;
            inner.next_sequence += 1;
            event.sequence = seq;
            inner.events.push_back(OutboundEvent { event, attempts: 0 });
            seq
        };
        self.wake.notify_one();
        seq
    }

    /// Cumulative-ack purge: drop every event with sequence strictly below
    /// `ack_seq`, preserving order. Tail insertion keeps the queue sorted by
    /// sequence, so the scan stops at the first entry at or past the ack.
    /// Returns how many events were retired.
    pub async fn purge(&self, ack_seq: u64) -> usize {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        while let Some(front) = inner.events.front() {
            if front.event.sequence >= ack_seq {
                break;
            }
            inner.events.pop_front();
            removed += 1;
        }
        if removed > 0 {
            debug!(ack_seq, removed, "purged acknowledged events");
        }
        removed
    }

    /// Take an ordered snapshot of every queued event for retransmission,
    /// incrementing each attempt counter. Never reorders or skips.
    pub async fn retransmit_batch(&self) -> Vec<Event> {
        let mut inner = self.inner.lock().await;
        inner
            .events
            .iter_mut()
            .map(|out| {
                out.attempts += 1;
                if out.attempts == RETRY_WARN_THRESHOLD {
                    warn!(
                        sequence = out.event.sequence,
                        attempts = out.attempts,
                        "event still undelivered after repeated attempts"
                    );
                }
                out.event.clone()
            })
            .collect()
    }

    /// The sender task's wake-up signal.
    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.events.is_empty()
    }

    /// The sequence number the next enqueued event will receive.
    pub async fn next_sequence(&self) -> u64 {
        self.inner.lock().await.next_sequence
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}
