// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{RegisteredClient, ServerConfig};
use crate::error::{AlarmError, ProcessOutcome, Result};
use crate::event::{
    AgentEvent, Event, EventKind, EventReceiver, EventSender, HookContext, HookRegistry,
    epoch_secs, event_channel,
};
use crate::state::{AlarmMachine, AlarmState};
use crate::transport::SessionStream;
use crate::transport::primary::MAX_DATAGRAM;
use crate::transport::secondary::{FRAME_TIMEOUT, SYNC_TIMEOUT, read_frame, write_frame};

/// Server-side record of one reporting client.
pub struct ReportingRecord {
    pub client_id: String,
    pin: String,
    next_expected: u64,
    received_first_message: bool,
    last_contact: u64,
    ip_connected: bool,
    machine: AlarmMachine,
}

impl ReportingRecord {
    fn new(reg: &RegisteredClient) -> Self {
        Self {
            client_id: reg.client_id.clone(),
            pin: reg.pin.clone(),
            next_expected: 1,
            received_first_message: false,
            last_contact: 0,
            ip_connected: false,
            machine: AlarmMachine::new(reg.egress_delay),
        }
    }
}

/// Point-in-time view of a reporting client, for operator surfaces.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub state: AlarmState,
    pub ip_connected: bool,
    pub next_expected: u64,
    pub last_contact: u64,
    pub breach_deadline: Option<u64>,
}

/// The central station. Authenticates clients, enforces sequencing, mirrors
/// each client's alarm state, and infers the events a client could never
/// send (breach, connectivity loss) from elapsed time.
///
/// One lock guards the registry; each record has its own, so traffic from
/// different clients is processed fully in parallel.
pub struct Server {
    clients: RwLock<HashMap<String, Arc<Mutex<ReportingRecord>>>>,
    listen_addr: String,
    ip_loss_tolerance: u64,
    hooks: HookRegistry,
    event_tx: EventSender,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, HookRegistry::new())
    }

    pub fn with_hooks(config: ServerConfig, hooks: HookRegistry) -> Self {
        let (event_tx, _rx) = event_channel(256);
        let clients = config
            .clients
            .iter()
            .map(|reg| {
                (
                    reg.client_id.clone(),
                    Arc::new(Mutex::new(ReportingRecord::new(reg))),
                )
            })
            .collect();
        Self {
            clients: RwLock::new(clients),
            listen_addr: config.listen_addr,
            ip_loss_tolerance: config.ip_loss_tolerance,
            hooks,
            event_tx,
        }
    }

    /// Subscribe to server notifications.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Add a client to the registry at runtime.
    pub async fn register_client(&self, reg: &RegisteredClient) {
        let mut clients = self.clients.write().await;
        clients.insert(
            reg.client_id.clone(),
            Arc::new(Mutex::new(ReportingRecord::new(reg))),
        );
    }

    /// Look up a client and check its pin. Unknown ids and pin mismatches
    /// are logged and reported as `None`; the caller sends nothing back, so
    /// the server cannot be used as a probing oracle.
    async fn authenticate(&self, client_id: &str, pin: &str) -> Option<Arc<Mutex<ReportingRecord>>> {
        let clients = self.clients.read().await;
        match clients.get(client_id) {
            Some(rec_arc) => {
                let rec = rec_arc.lock().await;
                if rec.pin == pin {
                    drop(rec);
                    Some(rec_arc.clone())
                } else {
                    warn!(client_id, "authentication failed: pin mismatch");
                    None
                }
            }
            None => {
                warn!(client_id, "authentication failed: unknown client");
                None
            }
        }
    }

    /// Handle one datagram frame. Returns the acknowledgment to send back,
    /// or `None` when the frame is dropped (malformed, unauthenticated, or
    /// an out-of-order sequence the client must retransmit).
    pub async fn handle_frame(&self, raw: &str, now: u64) -> Option<String> {
        let msg = match codec::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed message: {e}");
                return None;
            }
        };

        let rec_arc = self.authenticate(&msg.client_id, &msg.pin).await?;
        let mut rec = rec_arc.lock().await;
        self.note_contact(&mut rec, now);

        if msg.event.kind == EventKind::Ping {
            debug!(client_id = %rec.client_id, "ping");
            return Some(codec::encode_ping_ack());
        }

        match self.apply_event(&mut rec, &msg.event, now) {
            ProcessOutcome::Applied | ProcessOutcome::AlreadyApplied => {
                Some(codec::encode_ack(rec.next_expected))
            }
            ProcessOutcome::Rejected => None,
        }
    }

    /// Any valid authenticated message counts as contact and revives a
    /// client previously declared disconnected. Idempotent: re-noting a
    /// connected client emits nothing.
    fn note_contact(&self, rec: &mut ReportingRecord, now: u64) {
        rec.last_contact = now;
        if !rec.ip_connected {
            rec.ip_connected = true;
            info!(client_id = %rec.client_id, "connectivity restored");
            self.emit_inferred(&rec.client_id, EventKind::ConnectivityRestored, None);
        }
    }

    /// Sequencing plus state application for one transmitted event.
    ///
    /// The very first message from a client adopts its sequence number as
    /// the new expectation, so a client that restarted its counter after a
    /// reload resynchronizes on contact. After that: below the expectation
    /// is a replay (acknowledged again, not reapplied), above it is a gap
    /// (rejected, the client retransmits from the expectation), and only an
    /// exact match mutates the mirrored state.
    fn apply_event(&self, rec: &mut ReportingRecord, event: &Event, now: u64) -> ProcessOutcome {
        if !rec.received_first_message {
            if event.sequence != rec.next_expected {
                info!(
                    client_id = %rec.client_id,
                    sequence = event.sequence,
                    "first contact: adopting reported sequence"
                );
            }
            rec.next_expected = event.sequence;
            rec.received_first_message = true;
        }

        if event.sequence < rec.next_expected {
            debug!(
                client_id = %rec.client_id,
                sequence = event.sequence,
                next_expected = rec.next_expected,
                "replayed event, already applied"
            );
            return ProcessOutcome::AlreadyApplied;
        }
        if event.sequence > rec.next_expected {
            warn!(
                client_id = %rec.client_id,
                sequence = event.sequence,
                next_expected = rec.next_expected,
                "sequence gap, rejecting"
            );
            return ProcessOutcome::Rejected;
        }

        match event.kind {
            EventKind::Triggered => {
                let deadline = event.payload.as_deref().and_then(|p| p.parse::<u64>().ok());
                rec.machine.on_remote_trigger(deadline);
            }
            EventKind::Disarmed => {
                rec.machine.on_disarm();
            }
            EventKind::TempDisarmed => rec.machine.arm_for_egress(now),
            EventKind::Restored | EventKind::Ok => {}
            other => {
                // Inferred kinds are never legitimately transmitted.
                warn!(client_id = %rec.client_id, kind = other.description(), "unexpected transmitted kind");
            }
        }

        info!(
            client_id = %rec.client_id,
            sequence = event.sequence,
            kind = event.kind.description(),
            sensor = ?event.sensor,
            state = rec.machine.state().as_str(),
            "event applied"
        );
        self.hooks.fire(&HookContext {
            kind: event.kind,
            client_id: rec.client_id.clone(),
            sensor: event.sensor,
        });
        let _ = self.event_tx.send(AgentEvent::Applied {
            client_id: rec.client_id.clone(),
            event: event.clone(),
        });

        rec.next_expected += 1;
        ProcessOutcome::Applied
    }

    /// Periodic sweep: declare clients disconnected after the loss
    /// tolerance, and fire breaches whose deadline has elapsed. Runs once
    /// per tick regardless of traffic.
    pub async fn sweep(&self, now: u64) {
        let clients: Vec<Arc<Mutex<ReportingRecord>>> =
            self.clients.read().await.values().cloned().collect();

        for rec_arc in clients {
            let mut rec = rec_arc.lock().await;
            if rec.ip_connected && now.saturating_sub(rec.last_contact) > self.ip_loss_tolerance {
                rec.ip_connected = false;
                warn!(client_id = %rec.client_id, last_contact = rec.last_contact, "connectivity lost");
                self.emit_inferred(&rec.client_id, EventKind::ConnectivityLost, None);
            }
            if rec.machine.tick(now) {
                warn!(client_id = %rec.client_id, "breach: deadline elapsed with no disarm");
                self.emit_inferred(&rec.client_id, EventKind::Breach, None);
            }
        }
    }

    fn emit_inferred(&self, client_id: &str, kind: EventKind, sensor: Option<u32>) {
        self.hooks.fire(&HookContext {
            kind,
            client_id: client_id.to_string(),
            sensor,
        });
        let _ = self.event_tx.send(AgentEvent::Inferred {
            client_id: client_id.to_string(),
            kind,
        });
    }

    /// Socket-read plus sweep loop. Blocks until shutdown is signalled.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind(&self.listen_addr).await?;
        info!(listen = %self.listen_addr, "server listening");
        self.run_on(socket, shutdown).await
    }

    /// As [`run`](Self::run), but on an already-bound socket.
    pub async fn run_on(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sweep_tick = interval(Duration::from_secs(1));
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("server shutting down");
                        break;
                    }
                }
                _ = sweep_tick.tick() => {
                    self.sweep(epoch_secs()).await;
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, peer)) => {
                            let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
                            if let Some(ack) = self.handle_frame(&raw, epoch_secs()).await
                                && let Err(e) = socket.send_to(ack.as_bytes(), peer).await
                            {
                                warn!("ack send to {peer} failed: {e}");
                            }
                        }
                        Err(e) => warn!("datagram receive error: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Answer an inbound secondary session: send the synchronization
    /// marker, authenticate the id/pin exchange, then apply `#`-framed
    /// events serially, answering each batch terminator with a cumulative
    /// acknowledgment until the peer tears the parked session down.
    pub async fn answer<S: SessionStream>(&self, mut stream: S) -> Result<()> {
        write_frame(&mut stream, &codec::TERMINATOR.to_string()).await?;

        let login = read_frame(&mut stream, SYNC_TIMEOUT, "login").await?;
        let Some((client_id, pin)) = login.split_once(codec::FIELD_SEP) else {
            return Err(AlarmError::MalformedMessage {
                details: format!("bad login frame: {login:?}"),
            });
        };
        // Silent to the peer either way; only the ack after a batch reveals
        // anything, and an unauthenticated session never gets that far.
        let Some(rec_arc) = self.authenticate(client_id, pin).await else {
            return Err(AlarmError::AuthenticationFailed {
                client_id: client_id.to_string(),
            });
        };
        info!(client_id, "secondary session answered");

        let mut applied = 0usize;
        loop {
            let frame = match read_frame(&mut stream, FRAME_TIMEOUT, "event frame").await {
                Ok(frame) => frame,
                // The peer parks the session and eventually drops it; both
                // endings are a normal teardown.
                Err(AlarmError::SessionClosed) | Err(AlarmError::SessionTimeout { .. }) => break,
                Err(e) => return Err(e),
            };

            if frame.is_empty() {
                // Batch terminator: acknowledge cumulatively.
                let mut rec = rec_arc.lock().await;
                self.note_contact(&mut rec, epoch_secs());
                let ack = codec::encode_session_ack(rec.next_expected);
                drop(rec);
                write_frame(&mut stream, &ack).await?;
                continue;
            }

            let msg = match codec::decode(&format!("{frame}{}", codec::TERMINATOR)) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(client_id, "dropping malformed session frame: {e}");
                    continue;
                }
            };
            if msg.client_id != client_id || msg.pin != pin {
                warn!(client_id, "session frame credentials mismatch, dropping");
                continue;
            }

            let mut rec = rec_arc.lock().await;
            let now = epoch_secs();
            self.note_contact(&mut rec, now);
            if self.apply_event(&mut rec, &msg.event, now) == ProcessOutcome::Applied {
                applied += 1;
            }
        }

        debug!(client_id, applied, "secondary session ended");
        Ok(())
    }

    /// Snapshot of one client.
    pub async fn client(&self, client_id: &str) -> Option<ClientSnapshot> {
        let clients = self.clients.read().await;
        let rec_arc = clients.get(client_id)?.clone();
        drop(clients);
        let rec = rec_arc.lock().await;
        Some(snapshot_of(&rec))
    }

    /// Snapshot of every registered client.
    pub async fn clients(&self) -> Vec<ClientSnapshot> {
        let arcs: Vec<Arc<Mutex<ReportingRecord>>> =
            self.clients.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rec_arc in arcs {
            let rec = rec_arc.lock().await;
            out.push(snapshot_of(&rec));
        }
        out
    }
}

fn snapshot_of(rec: &ReportingRecord) -> ClientSnapshot {
    ClientSnapshot {
        client_id: rec.client_id.clone(),
        state: rec.machine.state(),
        ip_connected: rec.ip_connected,
        next_expected: rec.next_expected,
        last_contact: rec.last_contact,
        breach_deadline: rec.machine.breach_deadline(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_server() -> Server {
        Server::new(
            ServerConfig::builder()
                .ip_loss_tolerance(30)
                .client("club", "1234", 15)
                .build(),
        )
    }

    fn frame(seq: u64, kind: EventKind, sensor: Option<u32>, payload: Option<&str>) -> String {
        let event = Event {
            kind,
            sequence: seq,
            timestamp: "00:00".to_string(),
            sensor,
            payload: payload.map(str::to_string),
        };
        codec::encode("club", "1234", &event)
    }

    #[tokio::test]
    async fn test_in_sequence_events_apply_and_ack() {
        let server = test_server();
        for seq in 1..=3 {
            let ack = server
                .handle_frame(&frame(seq, EventKind::Triggered, Some(1), Some("100")), 10)
                .await;
            assert_eq!(ack, Some(codec::encode_ack(seq + 1)));
        }
        let snap = server.client("club").await.unwrap();
        assert_eq!(snap.next_expected, 4);
        assert_eq!(snap.state, AlarmState::Triggered);
    }

    #[tokio::test]
    async fn test_first_contact_resync() {
        let server = test_server();
        // Client restarted at some point; its first report is sequence 17.
        let ack = server
            .handle_frame(&frame(17, EventKind::Restored, Some(2), None), 10)
            .await;
        assert_eq!(ack, Some(codec::encode_ack(18)));
        // Only the first message resyncs: a jump afterwards is a gap.
        let ack = server
            .handle_frame(&frame(25, EventKind::Restored, Some(2), None), 11)
            .await;
        assert_eq!(ack, None);
    }

    #[tokio::test]
    async fn test_duplicate_is_idempotent() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let mut hooks = HookRegistry::new();
        hooks.on(EventKind::Disarmed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let server = Server::with_hooks(
            ServerConfig::builder().client("club", "1234", 15).build(),
            hooks,
        );

        server
            .handle_frame(&frame(1, EventKind::Triggered, Some(1), Some("50")), 10)
            .await
            .unwrap();
        let ack = server
            .handle_frame(&frame(2, EventKind::Disarmed, None, None), 11)
            .await;
        assert_eq!(ack, Some(codec::encode_ack(3)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The ack was lost; the client retransmits. Acknowledged again,
        // state untouched, hook not re-fired.
        let ack = server
            .handle_frame(&frame(2, EventKind::Disarmed, None, None), 12)
            .await;
        assert_eq!(ack, Some(codec::encode_ack(3)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(server.client("club").await.unwrap().state, AlarmState::Ok);
    }

    #[tokio::test]
    async fn test_gap_rejected_without_state_change() {
        let server = test_server();
        server
            .handle_frame(&frame(1, EventKind::Restored, Some(1), None), 10)
            .await
            .unwrap();
        // Sequence 3 while expecting 2.
        let ack = server
            .handle_frame(&frame(3, EventKind::Triggered, Some(1), Some("100")), 11)
            .await;
        assert_eq!(ack, None);
        let snap = server.client("club").await.unwrap();
        assert_eq!(snap.next_expected, 2);
        assert_eq!(snap.state, AlarmState::Ok);
    }

    #[tokio::test]
    async fn test_auth_failures_are_silent() {
        let server = test_server();
        let event = Event::new(EventKind::Restored, Some(1), None);
        let mut bad_pin = Event::clone(&event);
        bad_pin.sequence = 1;
        assert!(
            server
                .handle_frame(&codec::encode("club", "9999", &bad_pin), 10)
                .await
                .is_none()
        );
        assert!(
            server
                .handle_frame(&codec::encode("nobody", "1234", &bad_pin), 10)
                .await
                .is_none()
        );
        // Malformed frames likewise get no response.
        assert!(server.handle_frame("garbage", 10).await.is_none());
    }

    #[tokio::test]
    async fn test_ping_acks_and_restores_connectivity_once() {
        let server = test_server();
        let mut events = server.subscribe();

        let ping = codec::encode("club", "1234", &Event::ping());
        assert_eq!(server.handle_frame(&ping, 10).await, Some("*#".to_string()));
        assert_eq!(server.handle_frame(&ping, 11).await, Some("*#".to_string()));

        // Exactly one restoration for the two pings.
        match events.try_recv().unwrap() {
            AgentEvent::Inferred { client_id, kind } => {
                assert_eq!(client_id, "club");
                assert_eq!(kind, EventKind::ConnectivityRestored);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());

        let snap = server.client("club").await.unwrap();
        assert!(snap.ip_connected);
        assert_eq!(snap.last_contact, 11);
    }

    #[tokio::test]
    async fn test_sweep_infers_connectivity_loss_once() {
        let server = test_server();
        let ping = codec::encode("club", "1234", &Event::ping());
        server.handle_frame(&ping, 100).await.unwrap();

        let mut events = server.subscribe();
        // Tolerance is 30: still connected at the boundary.
        server.sweep(130).await;
        assert!(server.client("club").await.unwrap().ip_connected);

        server.sweep(131).await;
        assert!(!server.client("club").await.unwrap().ip_connected);
        // Repeat sweeps stay quiet.
        server.sweep(132).await;
        assert!(matches!(
            events.try_recv().unwrap(),
            AgentEvent::Inferred {
                kind: EventKind::ConnectivityLost,
                ..
            }
        ));
        assert!(events.try_recv().is_err());

        // Any valid message revives it.
        server.handle_frame(&ping, 140).await.unwrap();
        assert!(server.client("club").await.unwrap().ip_connected);
    }

    #[tokio::test]
    async fn test_sweep_infers_breach_from_mirrored_deadline() {
        let server = test_server();
        server
            .handle_frame(&frame(1, EventKind::Triggered, Some(1), Some("115")), 100)
            .await
            .unwrap();

        let mut events = server.subscribe();
        server.sweep(114).await;
        assert_eq!(
            server.client("club").await.unwrap().state,
            AlarmState::Triggered
        );

        server.sweep(115).await;
        assert_eq!(server.client("club").await.unwrap().state, AlarmState::Breach);
        assert!(matches!(
            events.try_recv().unwrap(),
            AgentEvent::Inferred {
                kind: EventKind::Breach,
                ..
            }
        ));
        // Fires once only.
        server.sweep(116).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disarm_clears_mirrored_deadline() {
        let server = test_server();
        server
            .handle_frame(&frame(1, EventKind::Triggered, Some(1), Some("115")), 100)
            .await
            .unwrap();
        server
            .handle_frame(&frame(2, EventKind::Disarmed, None, None), 110)
            .await
            .unwrap();

        let snap = server.client("club").await.unwrap();
        assert_eq!(snap.state, AlarmState::Ok);
        assert_eq!(snap.breach_deadline, None);

        // Nothing to infer afterwards.
        server.sweep(200).await;
        assert_eq!(server.client("club").await.unwrap().state, AlarmState::Ok);
    }
}
