//! Framed reader for the trading channel.
//!
//! The gate wire is length-prefixed: 2 bytes of little-endian body length,
//! 6 more bytes of fixed header, then the body. The reader hands each frame
//! to its listeners as one buffer, header included, so parsers can use the
//! contractual offsets directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{self, AsyncRead, AsyncReadExt};
use tracing::{debug, error};

/// Receives complete inbound frames (8-byte header + body).
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, frame: Vec<u8>);
}

/// Drain `input` until it fails. A read failure after `stopped` was set is
/// the expected teardown path and exits quietly; any other failure is a
/// transport fault the caller must treat as fatal (the gate does not
/// tolerate resynchronization mid-stream).
pub async fn run_reader<R: AsyncRead + Unpin>(
    mut input: R,
    listeners: Vec<Arc<dyn FrameListener>>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut input).await {
            Ok(frame) => deliver(&listeners, frame),
            Err(e) if stopped.load(Ordering::Acquire) => {
                debug!(error = %e, "gate reader cancelled");
                return;
            }
            Err(e) => {
                error!(error = %e, "gate read failed");
                return;
            }
        }
    }
}

/// Read one frame. End-of-stream mid-frame surfaces as `UnexpectedEof`.
async fn read_frame<R: AsyncRead + Unpin>(input: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 8];
    input.read_exact(&mut header).await?;
    let body_len = u16::from_le_bytes([header[0], header[1]]) as usize;

    let mut frame = vec![0u8; 8 + body_len];
    frame[..8].copy_from_slice(&header);
    input.read_exact(&mut frame[8..]).await?;
    Ok(frame)
}

/// A single listener takes the buffer by move; with more than one, each
/// gets an independent copy.
fn deliver(listeners: &[Arc<dyn FrameListener>], frame: Vec<u8>) {
    match listeners {
        [] => {}
        [only] => only.on_frame(frame),
        many => {
            for listener in many {
                listener.on_frame(frame.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl FrameListener for Collector {
        fn on_frame(&self, frame: Vec<u8>) {
            self.frames.lock().push(frame);
        }
    }

    fn build_frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + body.len()];
        buf[..2].copy_from_slice(&(body.len() as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&msg_type.to_le_bytes());
        buf[4..8].copy_from_slice(&crate::gate::protocol::SCHEMA_HEADER);
        buf[8..].copy_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn test_reader_recovers_frames() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let collector = Collector::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(run_reader(
            rx,
            vec![collector.clone() as Arc<dyn FrameListener>],
            stopped,
        ));

        let first = build_frame(7000, &[1, 2, 3, 4]);
        let second = build_frame(5007, &[0xFF; 8]);
        tx.write_all(&first).await.unwrap();
        tx.write_all(&second).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        reader.await.unwrap();

        let frames = collector.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], first);
        assert_eq!(frames[1], second);
    }

    #[tokio::test]
    async fn test_multiple_listeners_each_get_a_copy() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let a = Collector::new();
        let b = Collector::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(run_reader(
            rx,
            vec![
                a.clone() as Arc<dyn FrameListener>,
                b.clone() as Arc<dyn FrameListener>,
            ],
            stopped,
        ));

        let frame = build_frame(7008, &[9; 16]);
        tx.write_all(&frame).await.unwrap();
        drop(tx);
        reader.await.unwrap();

        assert_eq!(a.frames.lock().as_slice(), &[frame.clone()]);
        assert_eq!(b.frames.lock().as_slice(), &[frame]);
    }

    #[tokio::test]
    async fn test_eof_mid_frame_stops_the_reader() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let collector = Collector::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(run_reader(
            rx,
            vec![collector.clone() as Arc<dyn FrameListener>],
            stopped,
        ));

        // Header promises 32 body bytes, deliver only 4.
        let mut partial = build_frame(7000, &[0u8; 32]);
        partial.truncate(12);
        tx.write_all(&partial).await.unwrap();
        drop(tx);
        reader.await.unwrap();

        assert!(collector.frames.lock().is_empty());
    }
}
