//! Gate wire protocol: frame layouts, builders and parsers.
//!
//! Every frame on the trading channel is little-endian with a fixed header:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     body length (frame length - 8)
//! 2       2     message type
//! 4       4     schema id + version (04 1C 02 00)
//! 8       ...   body
//! ```
//!
//! Field offsets below are counted from the start of the frame and are
//! contractual; changing one silently desynchronizes us from the venue.

use super::codec;

/// Schema id + version bytes carried at offset 4 of every frame.
pub const SCHEMA_HEADER: [u8; 4] = [0x04, 0x1C, 0x02, 0x00];

/// Heartbeat period we request at session establishment (5 seconds).
pub const REQUESTED_HEARTBEAT_NS: u64 = 5_000_000_000;

// Session-layer message types (5000..5999 carry no sequence number).
pub const MSG_ESTABLISH: u16 = 5000;
pub const MSG_ESTABLISH_ACK: u16 = 5001;
pub const MSG_TERMINATE: u16 = 5003;
pub const MSG_SEQUENCE: u16 = 5007;
pub const MSG_FLOOD_REJECT: u16 = 5008;
pub const MSG_MESSAGE_REJECT: u16 = 5009;

// Client request message types.
pub const MSG_NEW_ORDER_SINGLE: u16 = 6001;
pub const MSG_ORDER_REPLACE: u16 = 6003;
pub const MSG_ORDER_MASS_CANCEL: u16 = 6004;

// Server report message types.
pub const MSG_NEW_ORDER_REPORT: u16 = 7000;
pub const MSG_NEW_ORDER_REJECT: u16 = 7001;
pub const MSG_REPLACE_REPORT: u16 = 7004;
pub const MSG_REPLACE_REJECT: u16 = 7005;
pub const MSG_EXECUTION_REPORT: u16 = 7008;

/// Mass-cancel side selector for "both books".
pub const CANCEL_BOTH_SIDES: i8 = -1;

/// Order book side. Wire encoding: 1 = buy, 2 = sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Buy = 1,
    Sell = 2,
}

impl Side {
    #[inline]
    pub fn wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Buy),
            2 => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Errors raised while decoding gate frames or establishing the session.
#[derive(Debug, Clone)]
pub enum GateError {
    /// First response after Establish was not a negotiated-heartbeat ack.
    Establish { msg_type: u16 },
    /// Frame shorter than its type's fixed layout.
    Truncated { msg_type: u16, len: usize },
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Establish { msg_type } => write!(
                f,
                "invalid establish response: message type {} (expected {})",
                msg_type, MSG_ESTABLISH_ACK
            ),
            Self::Truncated { msg_type, len } => {
                write!(f, "truncated frame: type {} length {}", msg_type, len)
            }
        }
    }
}

impl std::error::Error for GateError {}

/// Allocate a frame of `frame_len` bytes with the fixed header filled in.
fn frame(msg_type: u16, frame_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; frame_len];
    codec::write_u16(&mut buf, 0, (frame_len - 8) as u16);
    codec::write_u16(&mut buf, 2, msg_type);
    buf[4..8].copy_from_slice(&SCHEMA_HEADER);
    buf
}

/// Fill the TraceID sentinel and request id common to all order requests.
fn request_header(buf: &mut [u8], reqid: u64) {
    codec::write_u64(buf, 8, (-1i64) as u64);
    codec::write_u64(buf, 16, reqid);
}

/// Establish (5000), 20 bytes.
///
/// ```text
/// 8   8  requested heartbeat period, ns
/// 16  4  login id
/// ```
pub fn establish(heartbeat_ns: u64, login: u32) -> Vec<u8> {
    let mut buf = frame(MSG_ESTABLISH, 20);
    codec::write_u64(&mut buf, 8, heartbeat_ns);
    codec::write_u32(&mut buf, 16, login);
    buf
}

/// Sequence keepalive (5007), 16 bytes. The body is all `0xFF`: the sender
/// is heartbeating, not advancing sequence state.
pub fn sequence_heartbeat() -> Vec<u8> {
    let mut buf = frame(MSG_SEQUENCE, 16);
    buf[8..16].fill(0xFF);
    buf
}

/// NewOrderSingle (6001), 51 bytes. Always a GTC limit order.
///
/// ```text
/// 8   8  TraceID (-1)
/// 16  8  request id
/// 24  8  account id
/// 32  4  instrument id
/// 36  8  price, 1e-9 fixed point
/// 44  4  size
/// 48  1  order type (1 = limit)
/// 49  1  time in force (1 = GTC)
/// 50  1  side (1 = buy, 2 = sell)
/// ```
pub fn new_order_single(
    reqid: u64,
    account: i64,
    instrument: i32,
    price: u64,
    size: i32,
    side: Side,
) -> Vec<u8> {
    let mut buf = frame(MSG_NEW_ORDER_SINGLE, 51);
    request_header(&mut buf, reqid);
    codec::write_u64(&mut buf, 24, account as u64);
    codec::write_u32(&mut buf, 32, instrument as u32);
    codec::write_u64(&mut buf, 36, price);
    codec::write_u32(&mut buf, 44, size as u32);
    buf[48] = 1;
    buf[49] = 1;
    buf[50] = side.wire();
    buf
}

/// OrderReplaceRequest (6003), 46 bytes. Order type and time in force ride
/// as null (-1): a replace never changes them.
///
/// ```text
/// 8   8  TraceID (-1)
/// 16  8  request id
/// 24  8  order id being replaced
/// 32  8  new price, 1e-9 fixed point
/// 40  4  new size
/// 44  1  order type (-1 = unchanged)
/// 45  1  time in force (-1 = unchanged)
/// ```
pub fn order_replace(reqid: u64, order_id: i64, price: u64, size: i32) -> Vec<u8> {
    let mut buf = frame(MSG_ORDER_REPLACE, 46);
    request_header(&mut buf, reqid);
    codec::write_u64(&mut buf, 24, order_id as u64);
    codec::write_u64(&mut buf, 32, price);
    codec::write_u32(&mut buf, 40, size as u32);
    buf[44] = (-1i8) as u8;
    buf[45] = (-1i8) as u8;
    buf
}

/// OrderMassCancelRequest (6004), 37 bytes. Any side value other than
/// 1 (buy) or 2 (sell) is coerced to -1, "both books".
///
/// ```text
/// 8   8  TraceID (-1)
/// 16  8  request id
/// 24  8  account id
/// 32  4  instrument id
/// 36  1  side (1, 2, or -1)
/// ```
pub fn order_mass_cancel(reqid: u64, account: i64, instrument: i32, side: i8) -> Vec<u8> {
    let side = match side {
        1 | 2 => side,
        _ => CANCEL_BOTH_SIDES,
    };
    let mut buf = frame(MSG_ORDER_MASS_CANCEL, 37);
    request_header(&mut buf, reqid);
    codec::write_u64(&mut buf, 24, account as u64);
    codec::write_u32(&mut buf, 32, instrument as u32);
    buf[36] = side as u8;
    buf
}

/// NewOrderSingleReport (7000) fields the agent consumes.
#[derive(Debug, Clone, Copy)]
pub struct OrderPlaced {
    pub reqid: u64,
    pub timestamp: u64,
    pub order_id: i64,
    pub price: u64,
    pub size: i32,
    pub side: Option<Side>,
}

/// OrderReplaceReport (7004) fields the agent consumes.
#[derive(Debug, Clone, Copy)]
pub struct OrderReplaced {
    pub reqid: u64,
    pub timestamp: u64,
    pub order_id: i64,
    pub prev_order_id: i64,
    pub price: u64,
    pub size: i32,
}

/// ExecutionReport (7008) fields the agent consumes.
#[derive(Debug, Clone, Copy)]
pub struct Execution {
    pub timestamp: u64,
    pub order_id: i64,
    pub price: u64,
    pub filled: i32,
    pub remaining: i32,
}

fn ensure_len(buf: &[u8], min: usize, msg_type: u16) -> Result<(), GateError> {
    if buf.len() < min {
        return Err(GateError::Truncated {
            msg_type,
            len: buf.len(),
        });
    }
    Ok(())
}

/// NewOrderSingleReport: reqid(24), ts(32), orderid(52), price(60), size(68), side(74).
pub fn parse_new_order_report(buf: &[u8]) -> Result<OrderPlaced, GateError> {
    ensure_len(buf, 75, MSG_NEW_ORDER_REPORT)?;
    Ok(OrderPlaced {
        reqid: codec::read_u64(buf, 24),
        timestamp: codec::read_u64(buf, 32),
        order_id: codec::read_u64(buf, 52) as i64,
        price: codec::read_u64(buf, 60),
        size: codec::read_u32(buf, 68) as i32,
        side: Side::from_wire(buf[74]),
    })
}

/// OrderReplaceReport: reqid(24), ts(32), new orderid(40), price(48), size(56), old orderid(60).
pub fn parse_replace_report(buf: &[u8]) -> Result<OrderReplaced, GateError> {
    ensure_len(buf, 68, MSG_REPLACE_REPORT)?;
    Ok(OrderReplaced {
        reqid: codec::read_u64(buf, 24),
        timestamp: codec::read_u64(buf, 32),
        order_id: codec::read_u64(buf, 40) as i64,
        price: codec::read_u64(buf, 48),
        size: codec::read_u32(buf, 56) as i32,
        prev_order_id: codec::read_u64(buf, 60) as i64,
    })
}

/// ExecutionReport: ts(24), price(40), filled(48), orderid(52), remaining(60).
pub fn parse_execution_report(buf: &[u8]) -> Result<Execution, GateError> {
    ensure_len(buf, 64, MSG_EXECUTION_REPORT)?;
    Ok(Execution {
        timestamp: codec::read_u64(buf, 24),
        price: codec::read_u64(buf, 40),
        filled: codec::read_u32(buf, 48) as i32,
        order_id: codec::read_u64(buf, 52) as i64,
        remaining: codec::read_u32(buf, 60) as i32,
    })
}

/// NewOrderReject and OrderReplaceReject share a layout: reqid(24), reason(32).
pub fn parse_order_reject(buf: &[u8], msg_type: u16) -> Result<(u64, i32), GateError> {
    ensure_len(buf, 36, msg_type)?;
    Ok((codec::read_u64(buf, 24), codec::read_u32(buf, 32) as i32))
}

/// Terminate: reason(8).
pub fn parse_terminate(buf: &[u8]) -> Result<i32, GateError> {
    ensure_len(buf, 12, MSG_TERMINATE)?;
    Ok(codec::read_u32(buf, 8) as i32)
}

/// Sequence heartbeat: seq(8).
pub fn parse_sequence(buf: &[u8]) -> Result<u64, GateError> {
    ensure_len(buf, 16, MSG_SEQUENCE)?;
    Ok(codec::read_u64(buf, 8))
}

/// FloodReject: reqid(8), timeout_ns(20).
pub fn parse_flood_reject(buf: &[u8]) -> Result<(u64, u64), GateError> {
    ensure_len(buf, 28, MSG_FLOOD_REJECT)?;
    Ok((codec::read_u64(buf, 8), codec::read_u64(buf, 20)))
}

/// MessageReject: reqid(8), field(16), reason(20).
pub fn parse_message_reject(buf: &[u8]) -> Result<(u64, i32, i32), GateError> {
    ensure_len(buf, 24, MSG_MESSAGE_REJECT)?;
    Ok((
        codec::read_u64(buf, 8),
        codec::read_u32(buf, 16) as i32,
        codec::read_u32(buf, 20) as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let buf = frame(MSG_NEW_ORDER_SINGLE, 51);
        assert_eq!(buf.len(), 51);
        assert_eq!(codec::read_u16(&buf, 0), 43);
        assert_eq!(codec::read_u16(&buf, 2), MSG_NEW_ORDER_SINGLE);
        assert_eq!(&buf[4..8], &SCHEMA_HEADER);
    }

    #[test]
    fn test_establish_layout() {
        let buf = establish(REQUESTED_HEARTBEAT_NS, 42);
        assert_eq!(buf.len(), 20);
        assert_eq!(codec::read_u16(&buf, 2), MSG_ESTABLISH);
        assert_eq!(codec::read_u64(&buf, 8), 5_000_000_000);
        assert_eq!(codec::read_u32(&buf, 16), 42);
    }

    #[test]
    fn test_sequence_heartbeat_body_is_all_ones() {
        let buf = sequence_heartbeat();
        assert_eq!(buf.len(), 16);
        assert_eq!(codec::read_u16(&buf, 2), MSG_SEQUENCE);
        assert_eq!(&buf[8..16], &[0xFF; 8]);
    }

    #[test]
    fn test_new_order_single_layout() {
        let buf = new_order_single(77, -3, 1001, 99_000_000_000, 5, Side::Sell);
        assert_eq!(buf.len(), 51);
        assert_eq!(codec::read_u64(&buf, 8) as i64, -1);
        assert_eq!(codec::read_u64(&buf, 16), 77);
        assert_eq!(codec::read_u64(&buf, 24) as i64, -3);
        assert_eq!(codec::read_u32(&buf, 32) as i32, 1001);
        assert_eq!(codec::read_u64(&buf, 36), 99_000_000_000);
        assert_eq!(codec::read_u32(&buf, 44) as i32, 5);
        assert_eq!(buf[48], 1);
        assert_eq!(buf[49], 1);
        assert_eq!(buf[50], 2);
    }

    #[test]
    fn test_order_replace_layout() {
        let buf = order_replace(78, 123_456, 100_000_000_000, 7);
        assert_eq!(buf.len(), 46);
        assert_eq!(codec::read_u16(&buf, 0), 38);
        assert_eq!(codec::read_u64(&buf, 16), 78);
        assert_eq!(codec::read_u64(&buf, 24) as i64, 123_456);
        assert_eq!(codec::read_u64(&buf, 32), 100_000_000_000);
        assert_eq!(codec::read_u32(&buf, 40) as i32, 7);
        assert_eq!(buf[44] as i8, -1);
        assert_eq!(buf[45] as i8, -1);
    }

    #[test]
    fn test_mass_cancel_coerces_side() {
        for bad in [-1i8, 0, 3, 127] {
            let buf = order_mass_cancel(1, 1, 1, bad);
            assert_eq!(buf[36] as i8, CANCEL_BOTH_SIDES);
        }
        assert_eq!(order_mass_cancel(1, 1, 1, 1)[36] as i8, 1);
        assert_eq!(order_mass_cancel(1, 1, 1, 2)[36] as i8, 2);
    }

    #[test]
    fn test_new_order_report_roundtrip() {
        let mut buf = frame(MSG_NEW_ORDER_REPORT, 75);
        codec::write_u64(&mut buf, 24, 9001);
        codec::write_u64(&mut buf, 32, 1_700_000_000);
        codec::write_u64(&mut buf, 52, 555 as u64);
        codec::write_u64(&mut buf, 60, 101_000_000_000);
        codec::write_u32(&mut buf, 68, 4);
        buf[74] = 1;

        let report = parse_new_order_report(&buf).unwrap();
        assert_eq!(report.reqid, 9001);
        assert_eq!(report.timestamp, 1_700_000_000);
        assert_eq!(report.order_id, 555);
        assert_eq!(report.price, 101_000_000_000);
        assert_eq!(report.size, 4);
        assert_eq!(report.side, Some(Side::Buy));
    }

    #[test]
    fn test_replace_report_roundtrip() {
        let mut buf = frame(MSG_REPLACE_REPORT, 68);
        codec::write_u64(&mut buf, 24, 9002);
        codec::write_u64(&mut buf, 40, 556 as u64);
        codec::write_u64(&mut buf, 48, 98_000_000_000);
        codec::write_u32(&mut buf, 56, 3);
        codec::write_u64(&mut buf, 60, 555 as u64);

        let report = parse_replace_report(&buf).unwrap();
        assert_eq!(report.reqid, 9002);
        assert_eq!(report.order_id, 556);
        assert_eq!(report.prev_order_id, 555);
        assert_eq!(report.price, 98_000_000_000);
        assert_eq!(report.size, 3);
    }

    #[test]
    fn test_execution_report_roundtrip() {
        let mut buf = frame(MSG_EXECUTION_REPORT, 64);
        codec::write_u64(&mut buf, 24, 1_700_000_001);
        codec::write_u64(&mut buf, 40, 99_000_000_000);
        codec::write_u32(&mut buf, 48, 2);
        codec::write_u64(&mut buf, 52, 555 as u64);
        codec::write_u32(&mut buf, 60, 1);

        let exec = parse_execution_report(&buf).unwrap();
        assert_eq!(exec.timestamp, 1_700_000_001);
        assert_eq!(exec.price, 99_000_000_000);
        assert_eq!(exec.filled, 2);
        assert_eq!(exec.order_id, 555);
        assert_eq!(exec.remaining, 1);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let buf = frame(MSG_NEW_ORDER_REPORT, 40);
        assert!(matches!(
            parse_new_order_report(&buf),
            Err(GateError::Truncated { .. })
        ));
    }

    #[test]
    fn test_session_rejects_roundtrip() {
        let mut buf = frame(MSG_FLOOD_REJECT, 28);
        codec::write_u64(&mut buf, 8, 31);
        codec::write_u64(&mut buf, 20, 1_000_000_000);
        assert_eq!(parse_flood_reject(&buf).unwrap(), (31, 1_000_000_000));

        let mut buf = frame(MSG_MESSAGE_REJECT, 24);
        codec::write_u64(&mut buf, 8, 32);
        codec::write_u32(&mut buf, 16, 7);
        codec::write_u32(&mut buf, 20, (-2i32) as u32);
        assert_eq!(parse_message_reject(&buf).unwrap(), (32, 7, -2));

        let mut buf = frame(MSG_TERMINATE, 12);
        codec::write_u32(&mut buf, 8, 5);
        assert_eq!(parse_terminate(&buf).unwrap(), 5);
    }
}
