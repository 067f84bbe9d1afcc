// =============================================================================
// Shared types used across the Sentinel trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single OHLCV candle for the session's instrument and interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// ISO-8601 open timestamp of the bar.
    pub ts: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Best bid/ask/last snapshot. A tick with `last <= 0` is invalid and must be
/// dropped by the ingestion path before it reaches the broker or strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub ts: String,
}

/// One item of the provider's serialized market-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Candle(Candle),
    Tick(Tick),
}

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Used in PnL math.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// How an order enters: at the touch (market) or at a resting price (limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Market,
    Limit,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Name of the setup that produced an order, for the journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Setup {
    #[serde(default)]
    pub name: String,
}

/// A trade instruction handed to the broker. Produced by the strategy seam;
/// the engine itself never synthesizes orders.
///
/// `client_order_id` is mandatory: it is the idempotency key that guards
/// against double submission across retries and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub go: bool,
    pub side: Side,
    pub entry_type: EntryType,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub qty: f64,
    pub client_order_id: String,
    #[serde(default)]
    pub equity: f64,
    #[serde(default)]
    pub risk_pct: f64,
    #[serde(default)]
    pub rr_min: f64,
    #[serde(default)]
    pub lot_step: f64,
    #[serde(default)]
    pub min_notional: f64,
    #[serde(default)]
    pub setup: Setup,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "TRAIL")]
    Trail,
    #[serde(rename = "FORCE_CLOSE")]
    ForceClose,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit => write!(f, "TP"),
            Self::Trail => write!(f, "TRAIL"),
            Self::ForceClose => write!(f, "FORCE_CLOSE"),
        }
    }
}

/// A fill produced by the paper broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub client_order_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub fees: f64,
    /// True when the bar's volume capacity truncated the requested quantity
    /// and a working order holds the remainder.
    pub partial: bool,
    pub ts: String,
}

/// An exit produced by the paper broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitEvent {
    pub side: Side,
    pub qty: f64,
    pub entry: f64,
    pub price: f64,
    pub reason: ExitReason,
    pub pnl: f64,
    pub fees: f64,
    pub ts: String,
}

/// A funding charge applied to the open position at a funding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub rate: f64,
    pub notional: f64,
    /// Signed amount added to equity (negative = position paid funding).
    pub charge: f64,
    pub ts: String,
}

/// Non-fatal broker rejections. These are returned in `BrokerEvents::errors`,
/// logged, and never retried; they do not count against the session error
/// budget.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("KILL_SWITCH_ACTIVE")]
    KillSwitchActive,
    #[error("REJECTED: duplicate client_order_id {0}")]
    DuplicateOrderId(String),
    #[error("REJECTED: order missing client_order_id")]
    MissingOrderId,
    #[error("REJECTED: rate limit exceeded ({count} orders in the last minute, limit {limit})")]
    RateLimitExceeded { count: usize, limit: usize },
    #[error("REJECTED: Order notional exceeds limit (notional {notional:.2} > {limit:.2} USD)")]
    NotionalCapExceeded { notional: f64, limit: f64 },
    #[error("REJECTED: position cap exceeded (combined qty {combined} > {limit})")]
    PositionCapExceeded { combined: f64, limit: f64 },
    #[error("REJECTED: candle volume {volume} offers no fill capacity")]
    NoVolumeCapacity { volume: f64 },
    #[error("REJECTED: invalid price {0}")]
    InvalidPrice(f64),
    #[error("REJECTED: position already open on the opposite side")]
    OppositePositionOpen,
}

/// Everything a single `on_candle` / `on_tick` call produced.
#[derive(Debug, Clone, Default)]
pub struct BrokerEvents {
    pub fills: Vec<FillEvent>,
    pub exits: Vec<ExitEvent>,
    pub errors: Vec<BrokerError>,
}

impl BrokerEvents {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty() && self.exits.is_empty() && self.errors.is_empty()
    }
}
