//! Public market data stack: the order book observer.

pub mod observer;

pub use observer::{BookEntry, BookListener, MarketObserver};
