// =============================================================================
// Session Configuration — validated settings for one trading session
// =============================================================================
//
// Every field carries `#[serde(default)]` so older JSON configs keep loading
// when new fields appear. Validation is fatal: a session never starts on a
// bad config.
// =============================================================================

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_duration_min() -> u64 {
    60
}

fn default_starting_balance() -> f64 {
    10_000.0
}

fn default_risk_pct() -> f64 {
    1.0
}

fn default_maker_fee_bps() -> f64 {
    2.0
}

fn default_taker_fee_bps() -> f64 {
    6.0
}

fn default_slip_bps() -> f64 {
    0.5
}

fn default_stale_timeout_secs() -> u64 {
    120
}

fn default_execution_latency_ms() -> u64 {
    200
}

fn default_min_history_bars() -> usize {
    100
}

fn default_trail_atr_mult() -> f64 {
    1.5
}

fn default_max_daily_drawdown_pct() -> f64 {
    5.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_breaker_max_failures() -> u32 {
    5
}

fn default_breaker_reset_timeout_secs() -> f64 {
    300.0
}

fn default_max_position_qty() -> f64 {
    1_000_000.0
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".workspace/paper")
}

fn default_kill_file() -> PathBuf {
    PathBuf::from("kill.txt")
}

fn default_drain_wait_ms() -> u64 {
    2_000
}

fn loop_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether orders are simulated locally or routed to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Top-level configuration for a single trading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Candle interval, e.g. "1m", "5m", "1h".
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Session length; the timer task requests shutdown when it elapses.
    #[serde(default = "default_duration_min")]
    pub duration_min: u64,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,

    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,

    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,

    /// Adverse slippage applied to fills and exits, basis points.
    #[serde(default = "default_slip_bps")]
    pub slip_bps: f64,

    /// Shutdown when no candle or tick arrives for this long.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// Simulated order latency; skipped in dry-run.
    #[serde(default = "default_execution_latency_ms")]
    pub execution_latency_ms: u64,

    #[serde(default)]
    pub dry_run: bool,

    /// Candles requested from the provider before the session goes live.
    #[serde(default = "default_min_history_bars")]
    pub min_history_bars: usize,

    /// Trail distance multiplier over the initial risk unit R.
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: f64,

    /// Quote the instrument inverse (PnL in base currency).
    #[serde(default)]
    pub is_inverse: bool,

    #[serde(default = "default_max_daily_drawdown_pct")]
    pub max_daily_drawdown_pct: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    #[serde(default = "default_breaker_max_failures")]
    pub breaker_max_failures: u32,

    #[serde(default = "default_breaker_reset_timeout_secs")]
    pub breaker_reset_timeout_secs: f64,

    /// Combined open quantity allowed for the instrument.
    #[serde(default = "default_max_position_qty")]
    pub max_position_qty: f64,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_kill_file")]
    pub kill_file: PathBuf,

    /// Pause for in-flight fills during shutdown draining.
    #[serde(default = "default_drain_wait_ms")]
    pub drain_wait_ms: u64,

    /// Unique id of this session run.
    #[serde(default = "loop_id")]
    pub loop_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default config")
    }
}

impl SessionConfig {
    /// Fatal pre-start validation: a session never starts on a bad config.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.duration_min == 0 {
            bail!("duration_min must be positive");
        }
        if self.starting_balance <= 0.0 {
            bail!("starting_balance must be positive");
        }
        if self.maker_fee_bps < 0.0 || self.taker_fee_bps < 0.0 || self.slip_bps < 0.0 {
            bail!("fees and slippage must be non-negative");
        }
        if self.trail_atr_mult <= 0.0 {
            bail!("trail_atr_mult must be positive");
        }
        self.interval_secs()
            .with_context(|| format!("unsupported interval {:?}", self.interval))?;

        if self.execution_mode == ExecutionMode::Live {
            let key = std::env::var("BITUNIX_API_KEY").unwrap_or_default();
            let secret = std::env::var("BITUNIX_API_SECRET").unwrap_or_default();
            if key.is_empty() || secret.is_empty() {
                bail!("live mode requires BITUNIX_API_KEY and BITUNIX_API_SECRET");
            }
        }
        Ok(())
    }

    /// Interval length in seconds, parsed from forms like "30s", "1m", "4h",
    /// "1d".
    pub fn interval_secs(&self) -> Result<u64> {
        let s = self.interval.trim();
        let (num, unit) = s.split_at(s.len().saturating_sub(1));
        let n: u64 = num.parse().context("interval must start with a number")?;
        if n == 0 {
            bail!("interval must be positive");
        }
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3_600,
            "d" => n * 86_400,
            _ => bail!("interval unit must be one of s/m/h/d"),
        };
        Ok(secs)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.state_dir.join("heartbeat.json")
    }

    pub fn broker_state_path(&self) -> PathBuf {
        self.state_dir.join("paper_state.json")
    }
}
