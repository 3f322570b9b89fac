//! Trading channel session.
//!
//! One long-lived TCP connection to the exchange gate. `connect` performs
//! the Establish handshake inline, then hands the two socket halves to a
//! framed reader task and an outbound writer task. Inbound frames come back
//! to this object (it is the reader's single listener), get sequence-checked
//! and dispatched to the attached [`MessageHandler`].
//!
//! The channel never reconnects. A dead session is a dead process; the
//! venue's mass cancel is what keeps resting orders from outliving us.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::codec;
use super::protocol::{self, Execution, GateError, OrderPlaced, OrderReplaced, Side};
use super::reader::{run_reader, FrameListener};
use super::writer::run_writer;

/// Typed callbacks for inbound trading-channel events. Implementations must
/// not block: they run on the reader task.
pub trait MessageHandler: Send + Sync {
    fn on_order_placed(&self, report: OrderPlaced);
    fn on_new_order_reject(&self, reqid: u64, reason: i32);
    fn on_order_replaced(&self, report: OrderReplaced);
    fn on_replace_reject(&self, reqid: u64, reason: i32);
    fn on_execution(&self, exec: Execution);
    fn on_flood_reject(&self, reqid: u64, timeout_ns: u64);
    fn on_message_reject(&self, reqid: u64, field: i32, reason: i32);
    fn on_terminate(&self, reason: i32);
    /// The socket died outside an orderly `close()`.
    fn on_transport_error(&self);
}

/// Outbound order entry. Each call allocates the next request id, builds the
/// frame and enqueues it; the returned id correlates the eventual report or
/// reject.
pub trait OrderGateway: Send + Sync {
    fn new_order(&self, side: Side, price: u64, size: i32) -> u64;
    fn replace_order(&self, order_id: i64, price: u64, size: i32) -> u64;
    fn mass_cancel(&self, side: i8) -> u64;
}

/// Connection parameters for the gate.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub host: String,
    pub port: u16,
    pub login: u32,
    pub account: i64,
    pub instrument: i32,
    /// First request id this session may use. Seed it with the last run's
    /// reported high-water mark plus one.
    pub firstreq: u64,
}

pub struct TradingChannel {
    account: i64,
    instrument: i32,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    next_reqid: Mutex<u64>,
    expected_seq: AtomicU64,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for TradingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingChannel")
            .field("account", &self.account)
            .field("instrument", &self.instrument)
            .field("expected_seq", &self.expected_seq)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl TradingChannel {
    /// Connect and establish a session. On success the reader and writer
    /// tasks are already running; attach a handler before the first report
    /// is expected back.
    pub async fn connect(cfg: &GateConfig) -> Result<Arc<Self>> {
        let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .with_context(|| format!("connect gate {}:{}", cfg.host, cfg.port))?;

        stream
            .write_all(&protocol::establish(
                protocol::REQUESTED_HEARTBEAT_NS,
                cfg.login,
            ))
            .await
            .context("send establish")?;

        let mut ack = [0u8; 24];
        stream
            .read_exact(&mut ack[..8])
            .await
            .context("read establish response header")?;
        let msg_type = codec::read_u16(&ack, 2);
        if msg_type != protocol::MSG_ESTABLISH_ACK {
            return Err(GateError::Establish { msg_type }.into());
        }
        stream
            .read_exact(&mut ack[8..])
            .await
            .context("read establish response body")?;
        let server_heartbeat_ns = codec::read_u64(&ack, 8);
        let first_seq = codec::read_u64(&ack, 16);
        info!(
            server_heartbeat_ms = server_heartbeat_ns / 1_000_000,
            first_seq, "✅ gate session established"
        );

        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let channel = Arc::new(Self {
            account: cfg.account,
            instrument: cfg.instrument,
            outbound,
            next_reqid: Mutex::new(cfg.firstreq),
            expected_seq: AtomicU64::new(first_seq),
            handler: RwLock::new(None),
            stopped: stopped.clone(),
        });

        // The keepalive cadence is keyed to the period we requested; the
        // server's own period is recorded above for the operator.
        tokio::spawn(run_writer(
            write_half,
            queue,
            Duration::from_nanos(protocol::REQUESTED_HEARTBEAT_NS),
            stopped.clone(),
        ));

        let listener = channel.clone();
        tokio::spawn(async move {
            run_reader(
                read_half,
                vec![listener.clone() as Arc<dyn FrameListener>],
                stopped.clone(),
            )
            .await;
            if !stopped.load(Ordering::Acquire) {
                if let Some(handler) = listener.handler.read().clone() {
                    handler.on_transport_error();
                }
            }
        });

        Ok(channel)
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Stop both workers and close the socket. No session-layer goodbye:
    /// replies in flight may be lost.
    pub fn close(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            // Empty buffer wakes the writer, which shuts the socket down.
            let _ = self.outbound.send(Vec::new());
        }
    }

    fn next_reqid(&self) -> u64 {
        let mut guard = self.next_reqid.lock();
        let id = *guard;
        *guard += 1;
        id
    }

    fn enqueue(&self, frame: Vec<u8>) {
        if self.outbound.send(frame).is_err() {
            warn!("outbound queue closed, frame dropped");
        }
    }

    /// Sequence check for application-layer frames. A gap is logged and the
    /// expected counter deliberately not advanced: the session is out of
    /// step and the operator must act, we do not resynchronize.
    fn check_sequence(&self, frame: &[u8]) {
        if frame.len() < 16 {
            return;
        }
        let seq = codec::read_u64(frame, 8);
        let expected = self.expected_seq.load(Ordering::Relaxed);
        if seq == expected {
            self.expected_seq.store(expected + 1, Ordering::Relaxed);
        } else {
            warn!(seq, expected, "inbound sequence gap");
        }
    }

    fn dispatch(&self, frame: &[u8]) -> Result<(), GateError> {
        let msg_type = codec::read_u16(frame, 2);

        if !(5000..6000).contains(&msg_type) {
            self.check_sequence(frame);
        }

        let Some(handler) = self.handler.read().clone() else {
            debug!(msg_type, "no handler attached, frame dropped");
            return Ok(());
        };

        match msg_type {
            protocol::MSG_NEW_ORDER_REPORT => {
                handler.on_order_placed(protocol::parse_new_order_report(frame)?);
            }
            protocol::MSG_NEW_ORDER_REJECT => {
                let (reqid, reason) = protocol::parse_order_reject(frame, msg_type)?;
                handler.on_new_order_reject(reqid, reason);
            }
            protocol::MSG_REPLACE_REPORT => {
                handler.on_order_replaced(protocol::parse_replace_report(frame)?);
            }
            protocol::MSG_REPLACE_REJECT => {
                let (reqid, reason) = protocol::parse_order_reject(frame, msg_type)?;
                handler.on_replace_reject(reqid, reason);
            }
            protocol::MSG_EXECUTION_REPORT => {
                handler.on_execution(protocol::parse_execution_report(frame)?);
            }
            protocol::MSG_TERMINATE => {
                handler.on_terminate(protocol::parse_terminate(frame)?);
            }
            protocol::MSG_SEQUENCE => {
                let seq = protocol::parse_sequence(frame)?;
                let expected = self.expected_seq.load(Ordering::Relaxed);
                if seq != u64::MAX && seq != expected {
                    warn!(seq, expected, "heartbeat sequence mismatch");
                }
            }
            protocol::MSG_FLOOD_REJECT => {
                let (reqid, timeout_ns) = protocol::parse_flood_reject(frame)?;
                handler.on_flood_reject(reqid, timeout_ns);
            }
            protocol::MSG_MESSAGE_REJECT => {
                let (reqid, field, reason) = protocol::parse_message_reject(frame)?;
                handler.on_message_reject(reqid, field, reason);
            }
            other => {
                debug!(msg_type = other, "ignoring unhandled message type");
            }
        }
        Ok(())
    }
}

impl FrameListener for TradingChannel {
    fn on_frame(&self, frame: Vec<u8>) {
        if frame.len() < 8 {
            warn!(len = frame.len(), "runt frame from gate");
            return;
        }
        if let Err(e) = self.dispatch(&frame) {
            warn!(error = %e, "dropped malformed gate frame");
        }
    }
}

impl OrderGateway for TradingChannel {
    fn new_order(&self, side: Side, price: u64, size: i32) -> u64 {
        let reqid = self.next_reqid();
        debug!(reqid, %side, price, size, "new order");
        self.enqueue(protocol::new_order_single(
            reqid,
            self.account,
            self.instrument,
            price,
            size,
            side,
        ));
        reqid
    }

    fn replace_order(&self, order_id: i64, price: u64, size: i32) -> u64 {
        let reqid = self.next_reqid();
        debug!(reqid, order_id, price, size, "replace order");
        self.enqueue(protocol::order_replace(reqid, order_id, price, size));
        reqid
    }

    fn mass_cancel(&self, side: i8) -> u64 {
        let reqid = self.next_reqid();
        info!(reqid, side, "mass cancel");
        self.enqueue(protocol::order_mass_cancel(
            reqid,
            self.account,
            self.instrument,
            side,
        ));
        reqid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageHandler for Recording {
        fn on_order_placed(&self, report: OrderPlaced) {
            self.events
                .lock()
                .push(format!("placed:{}:{}", report.reqid, report.order_id));
        }
        fn on_new_order_reject(&self, reqid: u64, reason: i32) {
            self.events.lock().push(format!("reject:{reqid}:{reason}"));
        }
        fn on_order_replaced(&self, report: OrderReplaced) {
            self.events
                .lock()
                .push(format!("replaced:{}:{}", report.reqid, report.order_id));
        }
        fn on_replace_reject(&self, reqid: u64, reason: i32) {
            self.events
                .lock()
                .push(format!("replace_reject:{reqid}:{reason}"));
        }
        fn on_execution(&self, exec: Execution) {
            self.events
                .lock()
                .push(format!("exec:{}:{}", exec.order_id, exec.filled));
        }
        fn on_flood_reject(&self, reqid: u64, timeout_ns: u64) {
            self.events
                .lock()
                .push(format!("flood:{reqid}:{timeout_ns}"));
        }
        fn on_message_reject(&self, reqid: u64, field: i32, reason: i32) {
            self.events
                .lock()
                .push(format!("msg_reject:{reqid}:{field}:{reason}"));
        }
        fn on_terminate(&self, reason: i32) {
            self.events.lock().push(format!("terminate:{reason}"));
        }
        fn on_transport_error(&self) {
            self.events.lock().push("transport".to_string());
        }
    }

    fn test_channel(first_seq: u64) -> (Arc<TradingChannel>, Arc<Recording>) {
        let (outbound, _queue) = mpsc::unbounded_channel();
        let channel = Arc::new(TradingChannel {
            account: 7,
            instrument: 1,
            outbound,
            next_reqid: Mutex::new(100),
            expected_seq: AtomicU64::new(first_seq),
            handler: RwLock::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        });
        let handler = Recording::new();
        channel.set_handler(handler.clone());
        (channel, handler)
    }

    fn app_frame(msg_type: u16, frame_len: usize, seq: u64) -> Vec<u8> {
        let mut buf = vec![0u8; frame_len];
        codec::write_u16(&mut buf, 0, (frame_len - 8) as u16);
        codec::write_u16(&mut buf, 2, msg_type);
        buf[4..8].copy_from_slice(&protocol::SCHEMA_HEADER);
        if frame_len >= 16 {
            codec::write_u64(&mut buf, 8, seq);
        }
        buf
    }

    #[test]
    fn test_sequence_advances_on_match_only() {
        let (channel, _handler) = test_channel(5);

        channel.on_frame(app_frame(protocol::MSG_NEW_ORDER_REJECT, 36, 5));
        assert_eq!(channel.expected_seq.load(Ordering::Relaxed), 6);

        // Gap: logged, not advanced.
        channel.on_frame(app_frame(protocol::MSG_NEW_ORDER_REJECT, 36, 9));
        assert_eq!(channel.expected_seq.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_session_messages_skip_sequence_tracking() {
        let (channel, handler) = test_channel(5);

        let mut frame = app_frame(protocol::MSG_FLOOD_REJECT, 28, 42);
        codec::write_u64(&mut frame, 20, 1_000_000_000);
        channel.on_frame(frame);

        assert_eq!(channel.expected_seq.load(Ordering::Relaxed), 5);
        assert_eq!(
            handler.events.lock().as_slice(),
            &["flood:42:1000000000".to_string()]
        );
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let (channel, handler) = test_channel(1);

        let mut placed = app_frame(protocol::MSG_NEW_ORDER_REPORT, 75, 1);
        codec::write_u64(&mut placed, 24, 100);
        codec::write_u64(&mut placed, 52, 555);
        placed[74] = 1;
        channel.on_frame(placed);

        let mut term = app_frame(protocol::MSG_TERMINATE, 12, 0);
        codec::write_u32(&mut term, 8, 3);
        channel.on_frame(term);

        assert_eq!(
            handler.events.lock().as_slice(),
            &["placed:100:555".to_string(), "terminate:3".to_string()]
        );
    }

    #[test]
    fn test_malformed_frame_is_dropped_not_dispatched() {
        let (channel, handler) = test_channel(1);
        // Truncated execution report.
        channel.on_frame(app_frame(protocol::MSG_EXECUTION_REPORT, 40, 1));
        assert!(handler.events.lock().is_empty());
    }

    #[test]
    fn test_request_ids_strictly_increase() {
        let (channel, _handler) = test_channel(1);
        let a = channel.new_order(Side::Buy, 10, 1);
        let b = channel.replace_order(55, 20, 1);
        let c = channel.mass_cancel(protocol::CANCEL_BOTH_SIDES);
        assert_eq!((a, b, c), (100, 101, 102));
    }
}
