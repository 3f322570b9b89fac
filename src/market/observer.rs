//! Public order book observer.
//!
//! Maintains a single WebSocket connection to the venue's book feed,
//! subscribes to the orderbook channel, and keeps incremental bid/ask
//! ladders for one instrument. After every applied update the top of each
//! ladder is cut to the listener's depth and pushed out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::gate::protocol::Side;

/// Exact subscription request the feed expects.
const SUBSCRIBE_ORDERBOOK: &str = r#"{"method":1,"params":{"channel":"orderbook"},"id":1}"#;

/// WebSocket-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(14);

/// All prices leave this module as 1e-9 fixed point.
const PRICE_EXPONENT: i32 = -9;

/// One price level handed to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookEntry {
    pub instrument: i32,
    pub price: u64,
    pub amount: i32,
    pub side: Side,
}

/// Receives fixed-depth book snapshots, bids first. Slots past the end of a
/// shallow ladder are `None`. Called outside the observer lock, but still on
/// the feed's read task, so implementations must not block.
pub trait BookListener: Send + Sync {
    fn on_book(&self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]);
}

struct Registration {
    listener: Arc<dyn BookListener>,
    depth: usize,
}

#[derive(Default)]
struct Ladders {
    bids: BTreeMap<u64, i32>,
    asks: BTreeMap<u64, i32>,
    listener: Option<Registration>,
}

pub struct MarketObserver {
    endpoint: String,
    instrument: i32,
    state: Mutex<Ladders>,
}

/// Per-instrument payload inside an orderbook event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookUpdateMsg {
    #[serde(default)]
    is_snapshot: bool,
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: FeedPrice,
    size: i32,
}

#[derive(Debug, Deserialize)]
struct FeedPrice {
    mantissa: i64,
    exponent: i32,
}

impl MarketObserver {
    pub fn new(endpoint: String, instrument: i32) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            instrument,
            state: Mutex::new(Ladders::default()),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn BookListener>, depth: usize) {
        self.state.lock().listener = Some(Registration { listener, depth });
    }

    /// Connect, subscribe and pump the feed until it fails. The feed owns
    /// its connection; a close or transport error returns `Err` and the
    /// caller decides how fatal that is.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (ws, _) = connect_async(&self.endpoint)
            .await
            .with_context(|| format!("connect book feed {}", self.endpoint))?;
        info!(endpoint = %self.endpoint, "🔌 book feed connected");

        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(SUBSCRIBE_ORDERBOOK.to_string()))
            .await
            .context("send orderbook subscription")?;

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return Err(anyhow!("book feed ping failed: {e}"));
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("book feed stream ended"));
                    };
                    match msg {
                        Ok(Message::Text(text)) => self.apply_message(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            return Err(anyhow!("book feed closed: {frame:?}"));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("book feed error: {e}")),
                    }
                }
            }
        }
    }

    /// Parse one inbound text message and apply it if it is an orderbook
    /// event for our instrument. Messages carrying an `id` are request
    /// responses, not events.
    fn apply_message(&self, text: &str) {
        let json: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        if json.get("id").is_some() {
            debug!("subscription acknowledged");
            return;
        }
        let Some(result) = json.get("result") else {
            return;
        };
        if result.get("channel").and_then(|v| v.as_str()) != Some("orderbook") {
            return;
        }
        let key = self.instrument.to_string();
        let Some(value) = result
            .get("data")
            .and_then(|d| d.get("value"))
            .and_then(|v| v.get(&key))
        else {
            return;
        };
        let update: BookUpdateMsg = match serde_json::from_value(value.clone()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable orderbook update");
                return;
            }
        };
        self.apply_update(&update);
    }

    fn apply_update(&self, update: &BookUpdateMsg) {
        let mut state = self.state.lock();
        if update.is_snapshot {
            state.bids.clear();
            state.asks.clear();
        }
        for level in &update.bids {
            apply_level(&mut state.bids, level);
        }
        for level in &update.asks {
            apply_level(&mut state.asks, level);
        }

        let Some(reg) = &state.listener else {
            return;
        };
        let listener = reg.listener.clone();
        let bids = top_levels(&state.bids, reg.depth, self.instrument, Side::Buy);
        let asks = top_levels(&state.asks, reg.depth, self.instrument, Side::Sell);
        drop(state);

        listener.on_book(&bids, &asks);
    }
}

fn apply_level(ladder: &mut BTreeMap<u64, i32>, level: &BookLevel) {
    let price = scale_price(level.price.mantissa, level.price.exponent);
    if level.size > 0 {
        ladder.insert(price, level.size);
    } else {
        ladder.remove(&price);
    }
}

/// Normalize a `{mantissa, exponent}` price to 1e-9 fixed point by shifting
/// the mantissa one decimal digit at a time. Exponents below -9 lose their
/// sub-nano digits; the feed is not expected to produce them, and we accept
/// the truncation when it does.
fn scale_price(mantissa: i64, exponent: i32) -> u64 {
    let mut m = mantissa;
    let mut e = exponent;
    while e > PRICE_EXPONENT {
        m = m.saturating_mul(10);
        e -= 1;
    }
    while e < PRICE_EXPONENT {
        m /= 10;
        e += 1;
    }
    m.max(0) as u64
}

/// Cut the top `depth` levels into a fixed-length array, tail padded with
/// `None`. Bids walk the ladder descending, asks ascending.
fn top_levels(
    ladder: &BTreeMap<u64, i32>,
    depth: usize,
    instrument: i32,
    side: Side,
) -> Vec<Option<BookEntry>> {
    let mut out = vec![None; depth];
    let levels: Box<dyn Iterator<Item = (&u64, &i32)>> = match side {
        Side::Buy => Box::new(ladder.iter().rev()),
        Side::Sell => Box::new(ladder.iter()),
    };
    for (slot, (price, amount)) in out.iter_mut().zip(levels) {
        *slot = Some(BookEntry {
            instrument,
            price: *price,
            amount: *amount,
            side,
        });
    }
    out
}
