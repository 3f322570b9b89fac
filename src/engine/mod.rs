//! Quoting engine and its send-rate budget.

pub mod flood;
pub mod quoter;

pub use flood::FloodTracker;
pub use quoter::{EngineConfig, QuotingEngine, QUOTE_DEPTH};
