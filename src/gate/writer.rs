//! Outbound writer for the trading channel.
//!
//! Owns the write half and an unbounded FIFO of ready-to-send frames. When
//! the queue stays empty long enough that two-thirds of the negotiated
//! heartbeat period would pass without traffic, the writer injects a
//! sequence keepalive so the venue does not drop the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::protocol;

/// Drain the queue, heartbeating when idle. An empty buffer on the queue is
/// the stop wake-up; combined with the `stopped` flag it makes the loop exit
/// without draining and shut the socket down, which in turn unblocks the
/// reader.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut output: W,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    heartbeat: Duration,
    stopped: Arc<AtomicBool>,
) {
    let keepalive = protocol::sequence_heartbeat();
    let mut last_send = Instant::now();

    loop {
        if stopped.load(Ordering::Acquire) {
            let _ = output.shutdown().await;
            debug!("gate writer stopped");
            return;
        }

        let budget = (heartbeat * 2 / 3).saturating_sub(last_send.elapsed());
        let wait = Duration::from_millis(budget.as_millis() as u64);

        match timeout(wait, queue.recv()).await {
            Ok(Some(frame)) => {
                if frame.is_empty() {
                    // Stop wake-up; the flag check above does the rest.
                    continue;
                }
                if let Err(e) = output.write_all(&frame).await {
                    warn!(error = %e, "gate write failed");
                    return;
                }
                last_send = Instant::now();
            }
            Ok(None) => {
                debug!("outbound queue closed");
                return;
            }
            Err(_) => {
                if let Err(e) = output.write_all(&keepalive).await {
                    warn!(error = %e, "gate keepalive write failed");
                    return;
                }
                last_send = Instant::now();
            }
        }
    }
}
