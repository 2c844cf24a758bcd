// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::HashMap;

use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{AlarmError, Result};
use crate::event::{
    AgentEvent, Event, EventKind, EventReceiver, EventSender, HookContext, HookRegistry,
    epoch_secs, event_channel,
};
use crate::queue::DeliveryQueue;
use crate::sensor::Sensor;
use crate::state::{AlarmMachine, AlarmState};
use crate::transport::primary::PrimaryTransport;
use crate::transport::secondary;
use crate::transport::{Dialer, TransportKind};

/// Extra slack on top of 3×ping_interval before the link is written off.
const LOSS_EPSILON: u64 = 1;

/// Connectivity judgement for the primary link. Only a confirmed
/// acknowledgment moves `last_ack`; a local send success never does.
struct LinkState {
    ip_connected: bool,
    last_ack: u64,
    /// An out-of-band probe has gone out since the last ack.
    probe_sent: bool,
}

/// One client agent: owns its sensors, alarm machine, delivery queue and
/// transports, and runs as a single task multiplexing wake-ups, primary
/// acknowledgments and timers.
///
/// Sensor signals may arrive from any task; the agent's record and queue
/// are guarded per client, so agents never contend with each other.
pub struct ClientAgent<D: Dialer> {
    config: ClientConfig,
    sensors: Mutex<HashMap<u32, Sensor>>,
    machine: Mutex<AlarmMachine>,
    link: Mutex<LinkState>,
    queue: DeliveryQueue,
    primary: PrimaryTransport,
    dialer: D,
    hooks: HookRegistry,
    event_tx: EventSender,
}

impl<D: Dialer> ClientAgent<D> {
    /// Bind the primary transport and build the agent.
    pub async fn connect(config: ClientConfig, dialer: D) -> Result<Self> {
        Self::connect_with_hooks(config, dialer, HookRegistry::new()).await
    }

    pub async fn connect_with_hooks(
        config: ClientConfig,
        dialer: D,
        hooks: HookRegistry,
    ) -> Result<Self> {
        let primary = PrimaryTransport::connect(&config.bind_addr, &config.server_addr).await?;
        let sensors = config
            .sensors
            .iter()
            .map(|s| (s.id, Sensor::new(s.id, s.disarm_delay)))
            .collect();
        let (event_tx, _rx) = event_channel(256);
        info!(client_id = %config.client_id, server = %config.server_addr, "client agent ready");
        Ok(Self {
            machine: Mutex::new(AlarmMachine::new(config.egress_delay)),
            link: Mutex::new(LinkState {
                ip_connected: true,
                last_ack: epoch_secs(),
                probe_sent: false,
            }),
            sensors: Mutex::new(sensors),
            queue: DeliveryQueue::new(),
            primary,
            dialer,
            hooks,
            event_tx,
            config,
        })
    }

    /// Subscribe to this agent's notifications.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    // --- Sensor signals -------------------------------------------------

    /// A sensor went active. Computes the breach deadline, queues a
    /// TRIGGERED event (with the deadline as payload when the trigger has
    /// an alarm consequence) and wakes the sender. Returns the sequence.
    pub async fn trigger_sensor(&self, id: u32) -> Result<u64> {
        self.trigger_sensor_at(id, epoch_secs()).await
    }

    async fn trigger_sensor_at(&self, id: u32, now: u64) -> Result<u64> {
        let disarm_delay = {
            let mut sensors = self.sensors.lock().await;
            let sensor = sensors.get_mut(&id).ok_or(AlarmError::UnknownSensor { id })?;
            sensor.trigger();
            sensor.disarm_delay
        };
        let effect = {
            let mut machine = self.machine.lock().await;
            machine.on_trigger(disarm_delay, now)
        };
        info!(
            client_id = %self.config.client_id,
            sensor = id,
            armed = effect.armed,
            deadline = ?effect.deadline,
            "sensor triggered"
        );
        let payload = effect.deadline.map(|d| d.to_string());
        let seq = self
            .queue
            .enqueue(Event::new(EventKind::Triggered, Some(id), payload))
            .await;
        Ok(seq)
    }

    /// A sensor returned to rest. Queues a RESTORED event.
    pub async fn restore_sensor(&self, id: u32) -> Result<u64> {
        {
            let mut sensors = self.sensors.lock().await;
            let sensor = sensors.get_mut(&id).ok_or(AlarmError::UnknownSensor { id })?;
            sensor.restore();
        }
        debug!(client_id = %self.config.client_id, sensor = id, "sensor restored");
        let seq = self
            .queue
            .enqueue(Event::new(EventKind::Restored, Some(id), None))
            .await;
        Ok(seq)
    }

    /// A disarm request. Clears the breach deadline (entirely, even when
    /// other sensors are still triggered) and queues a DISARMED event.
    pub async fn disarm(&self) -> u64 {
        {
            let mut machine = self.machine.lock().await;
            machine.on_disarm();
        }
        info!(client_id = %self.config.client_id, "disarmed");
        self.queue
            .enqueue(Event::new(EventKind::Disarmed, None, None))
            .await
    }

    /// Temporary disarm for egress: triggers within the egress window are
    /// reported without alarm consequence. Queues a TEMP_DISARMED event.
    pub async fn arm_for_egress(&self) -> u64 {
        self.arm_for_egress_at(epoch_secs()).await
    }

    async fn arm_for_egress_at(&self, now: u64) -> u64 {
        {
            let mut machine = self.machine.lock().await;
            machine.arm_for_egress(now);
        }
        info!(client_id = %self.config.client_id, "temporarily disarmed for egress");
        self.queue
            .enqueue(Event::new(EventKind::TempDisarmed, None, None))
            .await
    }

    // --- Snapshots ------------------------------------------------------

    pub async fn state(&self) -> AlarmState {
        self.machine.lock().await.state()
    }

    pub async fn breach_deadline(&self) -> Option<u64> {
        self.machine.lock().await.breach_deadline()
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.ip_connected
    }

    // --- Task loop ------------------------------------------------------

    /// The agent's polling loop: multiplexes the enqueue wake-up, the
    /// primary receive path, the keep-alive timer and a one-second local
    /// sweep, until shutdown is signalled. Secondary sessions run inside
    /// the loop body and are the only potentially long operations; they
    /// hold no queue lock and watch the same shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Separate handle for secondary sessions so the select arm below
        // keeps exclusive use of `shutdown`.
        let session_shutdown = shutdown.clone();

        let mut ping_tick = interval(Duration::from_secs(self.config.ping_interval.max(1)));
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval(Duration::from_secs(1));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(client_id = %self.config.client_id, "client agent shutting down");
                        break;
                    }
                }
                _ = self.queue.wake().notified() => {
                    self.flush(&session_shutdown).await;
                }
                res = self.primary.recv() => {
                    match res {
                        Ok(raw) => self.handle_ack(&raw, epoch_secs()).await,
                        Err(e) => warn!(client_id = %self.config.client_id, "primary receive error: {e}"),
                    }
                }
                _ = ping_tick.tick() => {
                    self.send_ping().await;
                    self.flush(&session_shutdown).await;
                }
                _ = sweep_tick.tick() => {
                    self.on_sweep(epoch_secs()).await;
                }
            }
        }
        Ok(())
    }

    /// Send one keep-alive probe, always over the primary path: recovery
    /// can only be observed there. Bypasses the queue entirely.
    pub async fn send_ping(&self) {
        let frame = codec::encode(&self.config.client_id, &self.config.pin, &Event::ping());
        self.primary.send(&frame).await;
    }

    /// Retransmit pass over the currently selected transport. Called on
    /// every wake-up and keep-alive tick; resends every queued event in
    /// order and never errors out of the task.
    async fn flush(&self, session_shutdown: &watch::Receiver<bool>) {
        if self.queue.is_empty().await {
            return;
        }
        let connected = self.link.lock().await.ip_connected;
        let selected = if connected {
            TransportKind::Primary
        } else {
            TransportKind::Secondary
        };
        debug!(
            client_id = %self.config.client_id,
            transport = selected.as_str(),
            "retransmit pass"
        );
        if connected {
            let batch = self.queue.retransmit_batch().await;
            for event in &batch {
                let frame = codec::encode(&self.config.client_id, &self.config.pin, event);
                if !self.primary.send(&frame).await {
                    // A local send failure is judged immediately; the next
                    // pass goes over the secondary.
                    self.mark_disconnected(epoch_secs()).await;
                    break;
                }
            }
        } else {
            let mut shutdown = session_shutdown.clone();
            match secondary::run_session(
                &self.dialer,
                &self.config.client_id,
                &self.config.pin,
                &self.queue,
                Duration::from_secs(self.config.secondary_grace),
                &mut shutdown,
            )
            .await
            {
                Ok(acked) => {
                    debug!(client_id = %self.config.client_id, acked, "secondary session delivered");
                }
                Err(e) => {
                    // Never fatal: torn down and retried on the next wake-up.
                    warn!(client_id = %self.config.client_id, "secondary session failed: {e}");
                }
            }
        }
    }

    /// An acknowledgment arrived on the primary path. Purges the queue for
    /// event acks and refreshes the connectivity judgement for all of them.
    async fn handle_ack(&self, raw: &str, now: u64) {
        match codec::decode_ack(raw) {
            Ok(Some(next_expected)) => {
                self.queue.purge(next_expected).await;
                self.note_ack(now).await;
            }
            Ok(None) => self.note_ack(now).await,
            Err(e) => warn!(client_id = %self.config.client_id, "dropping malformed ack: {e}"),
        }
    }

    async fn note_ack(&self, now: u64) {
        let mut link = self.link.lock().await;
        link.last_ack = now;
        link.probe_sent = false;
        if !link.ip_connected {
            link.ip_connected = true;
            info!(client_id = %self.config.client_id, "connectivity restored");
            self.emit_inferred(EventKind::ConnectivityRestored);
        }
    }

    async fn mark_disconnected(&self, now: u64) {
        let mut link = self.link.lock().await;
        if link.ip_connected {
            link.ip_connected = false;
            link.probe_sent = false;
            warn!(
                client_id = %self.config.client_id,
                silent_for = now.saturating_sub(link.last_ack),
                "connectivity lost, failing over to secondary"
            );
            self.emit_inferred(EventKind::ConnectivityLost);
            drop(link);
            // Schedule a retransmit cycle so queued events fail over promptly.
            self.queue.wake().notify_one();
        }
    }

    /// One-second local sweep: fire an elapsed breach deadline and apply
    /// the connectivity policy (probe after 2×ping_interval of silence,
    /// write the link off after 3×ping_interval + 1).
    async fn on_sweep(&self, now: u64) {
        let breached = {
            let mut machine = self.machine.lock().await;
            machine.tick(now)
        };
        if breached {
            warn!(client_id = %self.config.client_id, "breach: no disarm before deadline");
            self.emit_inferred(EventKind::Breach);
        }

        let ping = self.config.ping_interval;
        let (probe, lost) = {
            let mut link = self.link.lock().await;
            if !link.ip_connected {
                (false, false)
            } else {
                let silence = now.saturating_sub(link.last_ack);
                if silence > 3 * ping + LOSS_EPSILON {
                    (false, true)
                } else if silence > 2 * ping && !link.probe_sent {
                    link.probe_sent = true;
                    (true, false)
                } else {
                    (false, false)
                }
            }
        };
        if lost {
            self.mark_disconnected(now).await;
        } else if probe {
            debug!(client_id = %self.config.client_id, "no ack lately, sending probe");
            self.send_ping().await;
        }
    }

    /// Breach and connectivity transitions are never transmitted; local
    /// collaborators hear about them through hooks and the event bus.
    fn emit_inferred(&self, kind: EventKind) {
        self.hooks.fire(&HookContext {
            kind,
            client_id: self.config.client_id.clone(),
            sensor: None,
        });
        let _ = self.event_tx.send(AgentEvent::Inferred {
            client_id: self.config.client_id.clone(),
            kind,
        });
    }
}
