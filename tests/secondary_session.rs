// MIT License - Copyright (c) 2026 Peter Wright

// The secondary (connection-oriented) channel end to end: the client's
// session driver against the server's answering side, over an in-memory
// duplex stream standing in for the dial/answer primitives.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{DuplexStream, duplex};
use tokio::sync::{Mutex, watch};

use alarm_station::transport::secondary::run_session;
use alarm_station::{
    AlarmState, DeliveryQueue, Dialer, Event, EventKind, Result, Server, ServerConfig,
};

/// Hands out a pre-connected stream once, as if the call had been answered.
struct OneShotDialer(Mutex<Option<DuplexStream>>);

impl OneShotDialer {
    fn new(stream: DuplexStream) -> Self {
        Self(Mutex::new(Some(stream)))
    }
}

impl Dialer for OneShotDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> Result<DuplexStream> {
        self.0
            .lock()
            .await
            .take()
            .ok_or(alarm_station::AlarmError::Disconnected)
    }
}

#[tokio::test]
async fn session_drains_queue_into_station() {
    let server = Arc::new(Server::new(
        ServerConfig::builder().client("club", "1234", 15).build(),
    ));

    let queue = DeliveryQueue::new();
    queue
        .enqueue(Event::new(
            EventKind::Triggered,
            Some(1),
            Some("4102444800".to_string()),
        ))
        .await;
    queue
        .enqueue(Event::new(EventKind::Restored, Some(1), None))
        .await;
    queue
        .enqueue(Event::new(EventKind::Disarmed, None, None))
        .await;

    let (client_side, server_side) = duplex(1024);
    let answering = server.clone();
    let answer_task = tokio::spawn(async move { answering.answer(server_side).await });

    let dialer = OneShotDialer::new(client_side);
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let acked = run_session(
        &dialer,
        "club",
        "1234",
        &queue,
        Duration::from_millis(50),
        &mut shutdown_rx,
    )
    .await
    .unwrap();

    // Cumulative ack covers all three events; the queue is purged.
    assert_eq!(acked, 4);
    assert!(queue.is_empty().await);

    answer_task.await.unwrap().unwrap();

    let snap = server.client("club").await.unwrap();
    assert_eq!(snap.next_expected, 4);
    // Triggered then disarmed: the mirror ends at rest.
    assert_eq!(snap.state, AlarmState::Ok);
    assert_eq!(snap.breach_deadline, None);
    assert!(snap.ip_connected);
}

#[tokio::test]
async fn second_batch_rides_the_parked_session() {
    let server = Arc::new(Server::new(
        ServerConfig::builder().client("club", "1234", 15).build(),
    ));

    let queue = Arc::new(DeliveryQueue::new());
    queue
        .enqueue(Event::new(
            EventKind::Triggered,
            Some(2),
            Some("4102444800".to_string()),
        ))
        .await;

    let (client_side, server_side) = duplex(1024);
    let answering = server.clone();
    let answer_task = tokio::spawn(async move { answering.answer(server_side).await });

    // While the session parks after the first batch, another event arrives.
    let feeder = {
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            queue
                .enqueue(Event::new(EventKind::Restored, Some(2), None))
                .await;
        })
    };

    let dialer = OneShotDialer::new(client_side);
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let acked = run_session(
        &dialer,
        "club",
        "1234",
        &queue,
        Duration::from_secs(2),
        &mut shutdown_rx,
    )
    .await
    .unwrap();

    feeder.await.unwrap();
    assert_eq!(acked, 3);
    assert!(queue.is_empty().await);
    answer_task.await.unwrap().unwrap();
    assert_eq!(server.client("club").await.unwrap().next_expected, 3);
}

#[tokio::test]
async fn bad_pin_session_is_torn_down_and_queue_keeps_events() {
    let server = Arc::new(Server::new(
        ServerConfig::builder().client("club", "1234", 15).build(),
    ));

    let queue = DeliveryQueue::new();
    queue
        .enqueue(Event::new(EventKind::Triggered, Some(1), None))
        .await;

    let (client_side, server_side) = duplex(1024);
    let answering = server.clone();
    let answer_task = tokio::spawn(async move { answering.answer(server_side).await });

    let dialer = OneShotDialer::new(client_side);
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let result = run_session(
        &dialer,
        "club",
        "9999",
        &queue,
        Duration::from_millis(50),
        &mut shutdown_rx,
    )
    .await;

    // The station hangs up without a word; the client sees a dead session
    // and keeps its events for the next attempt.
    let err = result.unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err}");
    assert_eq!(queue.len().await, 1);

    let err = answer_task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        alarm_station::AlarmError::AuthenticationFailed { .. }
    ));

    // Nothing was applied.
    assert_eq!(server.client("club").await.unwrap().next_expected, 1);
    assert!(!server.client("club").await.unwrap().ip_connected);
}
