//! Quoting engine.
//!
//! Keeps one resting bid and one resting ask centered on the market mid,
//! skewed by inventory, and reconciles them against live orders as reports
//! and book updates arrive.
//!
//! Concurrency discipline: all mutable state lives inside a single executor
//! task draining an event queue. The public [`QuotingEngine`] handle
//! implements the inbound callback traits by enqueueing, so gate callbacks
//! (reader task) and book callbacks (feed task) serialize through one
//! consumer and the state needs no locks. Handlers never block.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::gate::channel::{MessageHandler, OrderGateway};
use crate::gate::protocol::{Execution, OrderPlaced, OrderReplaced, Side, CANCEL_BOTH_SIDES};
use crate::market::observer::{BookEntry, BookListener};

use super::flood::FloodTracker;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Book depth the engine subscribes at. The second level backs the
/// self-quote strip when our own order is the top of book.
pub const QUOTE_DEPTH: usize = 2;

/// Flood window matching the gate's per-second accounting.
const FLOOD_PERIOD_NS: u64 = 1_000_000_000;

/// Replace reject raised when the target order is already gone; an expected
/// race against fills and cancels.
const REPLACE_REJECT_ORDER_GONE: i32 = 4;

/// New-order reject reasons with no recovery path.
const FATAL_REJECT_REASONS: [i32; 3] = [2, 3, 13];

/// Process-relative monotonic nanosecond timestamp
#[inline(always)]
fn mono_now_ns() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

// =============================================================================
// EVENTS AND HANDLE
// =============================================================================

/// Strategy parameters, fixed at construction. Prices are 1e-9 fixed point.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Standard quote size per side.
    pub volume: i32,
    /// Starting inventory.
    pub position: i32,
    pub maxposition: i32,
    /// Half-spread added on each side of the mid.
    pub interest: i64,
    /// Inventory skew per unit of position.
    pub shift: i64,
    /// Price tick.
    pub increment: i64,
    /// Max outbound requests per flood window.
    pub floodlimit: i32,
}

enum EngineEvent {
    Book {
        bids: Vec<Option<BookEntry>>,
        asks: Vec<Option<BookEntry>>,
    },
    Placed(OrderPlaced),
    PlaceRejected { reqid: u64, reason: i32 },
    Replaced(OrderReplaced),
    ReplaceRejected { reqid: u64, reason: i32 },
    Filled(Execution),
    FloodRejected { reqid: u64, timeout_ns: u64 },
    MessageRejected { reqid: u64, field: i32, reason: i32 },
    Terminated { reason: i32 },
    TransportLost,
    Shutdown,
}

/// Cloneable front of the engine: every inbound callback becomes an event
/// on the executor queue.
pub struct QuotingEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl QuotingEngine {
    /// Start the executor task. The returned join handle resolves to the
    /// process exit code once the engine has shut down.
    pub fn spawn(
        gateway: Arc<dyn OrderGateway>,
        config: EngineConfig,
    ) -> (Arc<Self>, JoinHandle<i32>) {
        let (events, mut queue) = mpsc::unbounded_channel();
        let mut state = EngineState::new(gateway, &config);

        let task = tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                state.handle(event);
                if let Some(code) = state.exit_code {
                    return code;
                }
            }
            // Every handle dropped without an explicit shutdown.
            state.shutdown();
            state.exit_code.unwrap_or(0)
        });

        (Arc::new(Self { events }), task)
    }

    /// Request an orderly stop: cancel both books, report the request-id
    /// high-water mark, exit 0. Safe to call from any task, any number of
    /// times; the exit hook and the normal path race onto the same queue.
    pub fn shutdown(&self) {
        let _ = self.events.send(EngineEvent::Shutdown);
    }

    fn push(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

impl BookListener for QuotingEngine {
    fn on_book(&self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]) {
        self.push(EngineEvent::Book {
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        });
    }
}

impl MessageHandler for QuotingEngine {
    fn on_order_placed(&self, report: OrderPlaced) {
        self.push(EngineEvent::Placed(report));
    }
    fn on_new_order_reject(&self, reqid: u64, reason: i32) {
        self.push(EngineEvent::PlaceRejected { reqid, reason });
    }
    fn on_order_replaced(&self, report: OrderReplaced) {
        self.push(EngineEvent::Replaced(report));
    }
    fn on_replace_reject(&self, reqid: u64, reason: i32) {
        self.push(EngineEvent::ReplaceRejected { reqid, reason });
    }
    fn on_execution(&self, exec: Execution) {
        self.push(EngineEvent::Filled(exec));
    }
    fn on_flood_reject(&self, reqid: u64, timeout_ns: u64) {
        self.push(EngineEvent::FloodRejected { reqid, timeout_ns });
    }
    fn on_message_reject(&self, reqid: u64, field: i32, reason: i32) {
        self.push(EngineEvent::MessageRejected {
            reqid,
            field,
            reason,
        });
    }
    fn on_terminate(&self, reason: i32) {
        self.push(EngineEvent::Terminated { reason });
    }
    fn on_transport_error(&self) {
        self.push(EngineEvent::TransportLost);
    }
}

// =============================================================================
// ENGINE STATE (EXECUTOR-EXCLUSIVE)
// =============================================================================

/// One side's resting order. `reqid != 0` marks a request in flight that
/// will mutate this side; nothing else may be dispatched on it until the
/// report or reject lands.
#[derive(Debug, Default, Clone, Copy)]
struct LiveOrder {
    order_id: i64,
    price: u64,
    amount: i32,
    reqid: u64,
}

struct EngineState {
    gateway: Arc<dyn OrderGateway>,
    volume: i32,
    maxposition: i32,
    interest: i64,
    shift: i64,
    increment: i64,

    position: i32,
    bid: LiveOrder,
    ask: LiveOrder,
    market_bid: u64,
    market_ask: u64,
    desired_bid_price: u64,
    desired_ask_price: u64,
    desired_bid_amount: i32,
    desired_ask_amount: i32,
    revision_pending: bool,
    /// Sends are gated until this instant. Flood penalties move it forward;
    /// shutdown pins it to `u64::MAX`.
    unlocktime: u64,
    last_reqid: u64,
    flood: FloodTracker,
    stopping: bool,
    exit_code: Option<i32>,
}

impl EngineState {
    fn new(gateway: Arc<dyn OrderGateway>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            volume: config.volume,
            maxposition: config.maxposition,
            interest: config.interest,
            shift: config.shift,
            increment: config.increment,
            position: config.position,
            bid: LiveOrder::default(),
            ask: LiveOrder::default(),
            market_bid: 0,
            market_ask: 0,
            desired_bid_price: 0,
            desired_ask_price: 0,
            desired_bid_amount: 0,
            desired_ask_amount: 0,
            revision_pending: false,
            unlocktime: 0,
            last_reqid: 0,
            flood: FloodTracker::new(config.floodlimit.max(0) as usize, FLOOD_PERIOD_NS),
            stopping: false,
            exit_code: None,
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Book { bids, asks } => self.on_book_update(&bids, &asks),
            EngineEvent::Placed(report) => {
                debug!(
                    reqid = report.reqid,
                    order_id = report.order_id,
                    price = report.price,
                    size = report.size,
                    "order placed"
                );
                self.on_order_installed(report.reqid, report.order_id, report.price, report.size);
            }
            EngineEvent::Replaced(report) => {
                debug!(
                    reqid = report.reqid,
                    order_id = report.order_id,
                    prev_order_id = report.prev_order_id,
                    "order replaced"
                );
                self.on_order_installed(report.reqid, report.order_id, report.price, report.size);
            }
            EngineEvent::PlaceRejected { reqid, reason } => self.on_place_rejected(reqid, reason),
            EngineEvent::ReplaceRejected { reqid, reason } => {
                self.on_replace_rejected(reqid, reason)
            }
            EngineEvent::Filled(exec) => self.on_filled(exec),
            EngineEvent::FloodRejected { reqid, timeout_ns } => {
                self.on_flood_rejected(reqid, timeout_ns)
            }
            EngineEvent::MessageRejected {
                reqid,
                field,
                reason,
            } => warn!(reqid, field, reason, "message rejected by gate"),
            EngineEvent::Terminated { reason } => {
                error!(reason, "session terminated by venue");
                self.shutdown();
                self.exit_code.get_or_insert(1);
            }
            EngineEvent::TransportLost => {
                error!("trading channel transport lost");
                self.shutdown();
                self.exit_code.get_or_insert(1);
            }
            EngineEvent::Shutdown => {
                self.shutdown();
                self.exit_code.get_or_insert(0);
            }
        }
    }

    // =========================================================================
    // STRATEGY
    // =========================================================================

    /// Recompute desired quotes from the current market and inventory, then
    /// dispatch if both sides are idle and sends are not gated. Otherwise
    /// flag the revision; the last landing report re-triggers dispatch.
    fn replace_orders(&mut self) {
        if self.market_bid == 0 || self.market_ask == 0 {
            return;
        }
        // Midpoint in unsigned space; the sum may wrap.
        let mid = self.market_bid.wrapping_add(self.market_ask) / 2;
        let skew = self.shift * i64::from(self.position);
        self.desired_bid_price = self.round_to_tick(mid as i64 - self.interest - skew, Side::Buy);
        self.desired_ask_price = self.round_to_tick(mid as i64 + self.interest - skew, Side::Sell);
        self.desired_bid_amount = self.volume.min(self.maxposition - self.position);
        self.desired_ask_amount = self.volume.min(self.position + self.maxposition);

        if self.bid.reqid == 0 && self.ask.reqid == 0 && mono_now_ns() >= self.unlocktime {
            self.dispatch();
        } else {
            self.revision_pending = true;
        }
    }

    /// Nearest tick multiple; a price exactly half a tick off widens the
    /// quote (bids round down, asks up) rather than tightening it.
    fn round_to_tick(&self, price: i64, side: Side) -> u64 {
        let rem = price.rem_euclid(self.increment);
        let floor = price - rem;
        let rounded = match (2 * rem).cmp(&self.increment) {
            std::cmp::Ordering::Less => floor,
            std::cmp::Ordering::Greater => floor + self.increment,
            std::cmp::Ordering::Equal => match side {
                Side::Buy => floor,
                Side::Sell => floor + self.increment,
            },
        };
        rounded.max(0) as u64
    }

    /// Send the desired quotes, one request per side: replace when a live
    /// order exists, place otherwise. Skipped wholesale unless the flood
    /// tracker admits every required send.
    fn dispatch(&mut self) {
        if self.stopping {
            return;
        }
        let now = mono_now_ns();
        if now < self.unlocktime {
            return;
        }
        let wanted =
            usize::from(self.desired_bid_amount > 0) + usize::from(self.desired_ask_amount > 0);
        if wanted == 0 || self.flood.available(now) < wanted {
            return;
        }

        if self.desired_bid_amount > 0 {
            self.flood.add(now);
            let reqid = if self.bid.amount > 0 {
                self.gateway.replace_order(
                    self.bid.order_id,
                    self.desired_bid_price,
                    self.desired_bid_amount,
                )
            } else {
                self.gateway
                    .new_order(Side::Buy, self.desired_bid_price, self.desired_bid_amount)
            };
            self.bid.reqid = reqid;
            self.note_reqid(reqid);
        }
        if self.desired_ask_amount > 0 {
            self.flood.add(now);
            let reqid = if self.ask.amount > 0 {
                self.gateway.replace_order(
                    self.ask.order_id,
                    self.desired_ask_price,
                    self.desired_ask_amount,
                )
            } else {
                self.gateway
                    .new_order(Side::Sell, self.desired_ask_price, self.desired_ask_amount)
            };
            self.ask.reqid = reqid;
            self.note_reqid(reqid);
        }
        self.revision_pending = false;
    }

    // =========================================================================
    // EVENT HANDLERS
    // =========================================================================

    /// The feed's ladders include our own resting orders; strip them before
    /// reading the market, then requote if either side moved.
    fn on_book_update(&mut self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]) {
        let stripped_bid = strip_own(bids, &self.bid);
        let stripped_ask = strip_own(asks, &self.ask);
        let (Some(market_bid), Some(market_ask)) = (stripped_bid, stripped_ask) else {
            debug!("book update leaves a side empty, keeping last market");
            return;
        };
        if market_bid != self.market_bid || market_ask != self.market_ask {
            self.market_bid = market_bid;
            self.market_ask = market_ask;
            self.replace_orders();
        }
    }

    fn on_order_installed(&mut self, reqid: u64, order_id: i64, price: u64, size: i32) {
        let Some(side) = self.side_of_reqid(reqid) else {
            warn!(reqid, order_id, "report for unknown request");
            return;
        };
        let live = self.live_mut(side);
        live.order_id = order_id;
        live.price = price;
        live.amount = size;
        live.reqid = 0;

        if self.bid.reqid == 0 && self.ask.reqid == 0 && self.revision_pending {
            self.dispatch();
        }
    }

    fn on_place_rejected(&mut self, reqid: u64, reason: i32) {
        if let Some(side) = self.side_of_reqid(reqid) {
            self.live_mut(side).reqid = 0;
        }
        if FATAL_REJECT_REASONS.contains(&reason) {
            error!(reqid, reason, "unrecoverable order reject");
            self.shutdown();
            self.exit_code.get_or_insert(1);
        } else {
            warn!(reqid, reason, "order rejected, side quiescent until next update");
        }
    }

    /// Reason 4 means the order was already gone when the replace arrived, a
    /// routine race. Either way the side has no order anymore; put a fresh
    /// one up if we still want size there and the budget allows.
    fn on_replace_rejected(&mut self, reqid: u64, reason: i32) {
        if reason == REPLACE_REJECT_ORDER_GONE {
            debug!(reqid, "replace raced an order teardown");
        } else {
            warn!(reqid, reason, "unexpected replace reject");
        }
        let Some(side) = self.side_of_reqid(reqid) else {
            warn!(reqid, "replace reject for unknown request");
            return;
        };
        *self.live_mut(side) = LiveOrder::default();

        let (price, amount) = self.desired(side);
        let now = mono_now_ns();
        if amount > 0 && !self.stopping && now >= self.unlocktime && self.flood.add(now) {
            let reqid = self.gateway.new_order(side, price, amount);
            self.live_mut(side).reqid = reqid;
            self.note_reqid(reqid);
        }
    }

    fn on_filled(&mut self, exec: Execution) {
        let side = if exec.order_id != 0 && self.bid.order_id == exec.order_id {
            Side::Buy
        } else if exec.order_id != 0 && self.ask.order_id == exec.order_id {
            Side::Sell
        } else {
            debug!(order_id = exec.order_id, "execution for unknown order");
            return;
        };
        match side {
            Side::Buy => self.position += exec.filled,
            Side::Sell => self.position -= exec.filled,
        }
        info!(
            order_id = exec.order_id,
            %side,
            price = exec.price,
            filled = exec.filled,
            remaining = exec.remaining,
            position = self.position,
            "execution"
        );
        let live = self.live_mut(side);
        live.amount = exec.remaining;
        if exec.remaining == 0 {
            // Fully filled: the venue has retired the order.
            *live = LiveOrder::default();
            self.replace_orders();
        }
    }

    fn on_flood_rejected(&mut self, reqid: u64, timeout_ns: u64) {
        warn!(
            reqid,
            penalty_ms = timeout_ns / 1_000_000,
            "flood reject from gate"
        );
        if let Some(side) = self.side_of_reqid(reqid) {
            self.live_mut(side).reqid = 0;
        }
        if !self.stopping {
            self.unlocktime = mono_now_ns().saturating_add(timeout_ns);
        }
    }

    /// Sinkhole further sends, cancel both books, report the request-id
    /// high-water mark the operator must seed the next run with.
    fn shutdown(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.unlocktime = u64::MAX;
        let reqid = self.gateway.mass_cancel(CANCEL_BOTH_SIDES);
        self.note_reqid(reqid);
        info!(
            last_reqid = self.last_reqid,
            "quoting stopped, start the next session with firstreq above last_reqid"
        );
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn side_of_reqid(&self, reqid: u64) -> Option<Side> {
        if reqid == 0 {
            None
        } else if self.bid.reqid == reqid {
            Some(Side::Buy)
        } else if self.ask.reqid == reqid {
            Some(Side::Sell)
        } else {
            None
        }
    }

    fn live_mut(&mut self, side: Side) -> &mut LiveOrder {
        match side {
            Side::Buy => &mut self.bid,
            Side::Sell => &mut self.ask,
        }
    }

    fn desired(&self, side: Side) -> (u64, i32) {
        match side {
            Side::Buy => (self.desired_bid_price, self.desired_bid_amount),
            Side::Sell => (self.desired_ask_price, self.desired_ask_amount),
        }
    }

    fn note_reqid(&mut self, reqid: u64) {
        self.last_reqid = self.last_reqid.max(reqid);
    }
}

/// Best market level that is not our own order. Our order is recognized by
/// price equality with an amount no larger than what we have resting; in
/// that case the next level is the market.
fn strip_own(levels: &[Option<BookEntry>], own: &LiveOrder) -> Option<u64> {
    let mut levels = levels.iter().flatten();
    let top = levels.next()?;
    if own.amount > 0 && top.price == own.price && top.amount <= own.amount {
        return levels.next().map(|entry| entry.price);
    }
    Some(top.price)
}
