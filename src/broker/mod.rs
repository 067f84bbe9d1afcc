// =============================================================================
// Broker abstraction — position lifecycle behind a trait object
// =============================================================================
//
// The session tasks only ever see `Arc<dyn Broker>`. The paper variant is the
// one that ships; live execution would plug in here but its exchange client
// is outside this crate, so asking for it is a configuration error.
// =============================================================================

pub mod paper;

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::events::EventLog;
use crate::session_config::{ExecutionMode, SessionConfig};
use crate::types::{
    BrokerEvents, Candle, EntryType, ExitEvent, FundingEvent, Order, Side, Tick,
};

/// A single fill that contributed to the current position (FIFO accounting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub qty: f64,
    pub price: f64,
    #[serde(default)]
    pub fees: f64,
}

/// The open position. Owned exclusively by the broker; callers get clones.
///
/// Invariants: `qty` equals the sum of lot quantities within floating
/// tolerance, the stop and target sit on the correct side of `entry`, and at
/// most one position exists per broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry: f64,
    pub qty: f64,
    pub sl: f64,
    pub tp: f64,
    pub opened_at: String,
    #[serde(default)]
    pub entry_fees: f64,
    #[serde(default)]
    pub bars_open: u64,
    #[serde(default)]
    pub trail_active: bool,
    #[serde(default)]
    pub trail_stop: f64,
    /// Stop at entry time; the risk unit R = |entry − initial_sl| never moves
    /// even when the live stop trails.
    #[serde(default)]
    pub initial_sl: f64,
    #[serde(default)]
    pub lots: Vec<Lot>,
}

/// The unfilled remainder of a submitted order, waiting for volume on
/// subsequent candles. Tagged with the originating `client_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub client_order_id: String,
    pub side: Side,
    pub entry_type: EntryType,
    pub entry: f64,
    pub qty: f64,
    pub sl: f64,
    pub tp: f64,
    pub created_at: String,
}

pub trait Broker: Send + Sync {
    /// Primary loop entry: evaluate one candle, optionally submitting an
    /// order, and return all fills, exits, and rejections it produced.
    fn on_candle(&self, candle: &Candle, order: Option<&Order>, tick: Option<&Tick>)
        -> BrokerEvents;

    /// Intra-candle SL/TP/trail evaluation against a tick.
    fn on_tick(&self, tick: &Tick) -> BrokerEvents;

    fn unrealized_pnl(&self, price: f64) -> f64;

    /// Emergency exit of the open position at the given price.
    fn close_all(&self, price: f64) -> Vec<ExitEvent>;

    fn cancel_all_open_orders(&self);

    /// Persist final state for crash recovery. Resting orders are cancelled
    /// separately (and earlier) by the coordinator's drain sequence.
    fn shutdown(&self);

    fn save_state(&self) -> Result<()>;

    fn position(&self) -> Option<Position>;

    fn working_orders(&self) -> Vec<WorkingOrder>;

    /// Park an order as a working order without executing it. Used by the
    /// shutdown drain so queued orders survive to disk.
    fn push_working_order(&self, order: &Order);

    fn current_equity(&self) -> f64;

    fn starting_equity(&self) -> Option<f64>;

    fn set_starting_equity(&self, equity: f64);

    /// Apply a funding-rate charge to the open position, if any.
    fn apply_funding(&self, rate: f64, ts: &str) -> Option<FundingEvent>;
}

/// Construct the broker for the configured execution mode.
pub fn build_broker(config: &SessionConfig, event_log: Arc<EventLog>) -> Result<Arc<dyn Broker>> {
    match config.execution_mode {
        ExecutionMode::Paper => Ok(Arc::new(paper::PaperBroker::from_session_config(
            config,
            Some(event_log),
        ))),
        ExecutionMode::Live => {
            bail!("live execution requires an exchange broker; only paper ships in this build")
        }
    }
}
