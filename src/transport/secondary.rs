// MIT License - Copyright (c) 2026 Peter Wright

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use tracing::{debug, info};

use crate::codec;
use crate::error::{AlarmError, Result};
use crate::queue::DeliveryQueue;
use crate::transport::Dialer;

/// How long to wait for the peer's synchronization marker after answer.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the cumulative acknowledgment of a batch.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the answering side waits for the next frame of a parked session.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Read one `#`-terminated frame, returning its body without the terminator.
/// An empty body is the synchronization marker / batch terminator.
pub async fn read_frame<S>(stream: &mut S, wait: Duration, waiting_for: &'static str) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(wait, stream.read(&mut byte))
            .await
            .map_err(|_| AlarmError::SessionTimeout { waiting_for })??;
        if n == 0 {
            return Err(AlarmError::SessionClosed);
        }
        if byte[0] == codec::TERMINATOR as u8 {
            break;
        }
        body.push(byte[0]);
        if body.len() > 512 {
            return Err(AlarmError::MalformedMessage {
                details: "oversized session frame".to_string(),
            });
        }
    }
    String::from_utf8(body).map_err(|_| AlarmError::MalformedMessage {
        details: "non-ascii session frame".to_string(),
    })
}

/// Write a pre-encoded, already-terminated frame.
pub async fn write_frame<S>(stream: &mut S, frame: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Dial a TCP endpoint as the outbound session primitive. The production
/// host wires the real line-signaling layer in through [`Dialer`] instead.
pub struct TcpDialer {
    pub addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(&self.addr).await?)
    }
}

/// Drive one complete outbound secondary session.
///
/// Place the session, wait for the peer's synchronization marker, identify
/// with client id and pin, then drain the queue: every unacknowledged event
/// serially in ascending sequence order, an empty frame as terminator, and a
/// cumulative acknowledgment back, which purges the queue. The session then
/// parks idle for `grace` in case another event needs to go out immediately;
/// a wake-up during the grace period starts another drain on the same
/// session. Returns the last acknowledged sequence.
///
/// Establishing and driving the session can take seconds and never holds
/// the queue lock; enqueues proceed concurrently and simply wake the parked
/// session.
pub async fn run_session<D: Dialer>(
    dialer: &D,
    client_id: &str,
    pin: &str,
    queue: &DeliveryQueue,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<u64> {
    debug!(client_id, "placing secondary session");
    let mut stream = dialer.dial().await?;

    let marker = read_frame(&mut stream, SYNC_TIMEOUT, "sync marker").await?;
    if !marker.is_empty() {
        return Err(AlarmError::MalformedMessage {
            details: format!("unexpected sync marker: {marker:?}"),
        });
    }

    write_frame(
        &mut stream,
        &format!("{client_id}{}{pin}{}", codec::FIELD_SEP, codec::TERMINATOR),
    )
    .await?;
    info!(client_id, "secondary session established");

    let mut last_ack = 0;
    loop {
        let batch = queue.retransmit_batch().await;
        for event in &batch {
            write_frame(&mut stream, &codec::encode(client_id, pin, event)).await?;
        }
        write_frame(&mut stream, &codec::TERMINATOR.to_string()).await?;

        let ack_body = read_frame(&mut stream, ACK_TIMEOUT, "cumulative ack").await?;
        let ack = codec::decode_session_ack(&ack_body)?;
        let purged = queue.purge(ack).await;
        debug!(client_id, ack, purged, sent = batch.len(), "secondary batch acknowledged");
        last_ack = ack;

        // Idle-parked: the session stays up for the grace period in case
        // another event arrives, then tears down. A wake-up with nothing
        // queued (a permit left over from a drain already covered above)
        // keeps the session parked rather than starting an empty drain.
        let deadline = tokio::time::Instant::now() + grace;
        let mut redrain = false;
        loop {
            tokio::select! {
                _ = queue.wake().notified() => {
                    if !queue.is_empty().await {
                        redrain = true;
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if !redrain {
            break;
        }
    }

    debug!(client_id, "secondary session torn down");
    Ok(last_ack)
}
