//! quotebot library
//!
//! Exposes the trading channel, market observer and quoting engine for the
//! binary and the integration tests.

pub mod config;
pub mod engine;
pub mod gate;
pub mod market;

// Re-export the boundary types at crate root for convenience
pub use engine::{EngineConfig, QuotingEngine, QUOTE_DEPTH};
pub use gate::{GateConfig, MessageHandler, OrderGateway, Side, TradingChannel};
pub use market::{BookEntry, BookListener, MarketObserver};
