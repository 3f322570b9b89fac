//! Trading channel ("gate") stack.
//!
//! Binary little-endian session protocol over TCP:
//! - codec/protocol: fixed-offset field access, frame builders and parsers
//! - reader/writer: framed socket pump with keepalive injection
//! - channel: session establishment, sequencing and typed dispatch

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod reader;
pub mod writer;

pub use channel::{GateConfig, MessageHandler, OrderGateway, TradingChannel};
pub use protocol::{Execution, GateError, OrderPlaced, OrderReplaced, Side};
pub use reader::FrameListener;
