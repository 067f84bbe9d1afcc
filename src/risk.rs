// =============================================================================
// Trading Circuit Breaker — equity-based capital protection
// =============================================================================
//
// Two trip conditions:
//   1. Daily drawdown — (starting_equity − equity) / starting_equity * 100
//      reaches `max_daily_drawdown_pct`.
//   2. Consecutive losses — the losing streak reaches
//      `max_consecutive_losses` (any non-negative PnL resets the streak).
//
// Once tripped the breaker stays tripped until an explicit `reset()` or the
// next UTC day. Daily counters reset automatically when the date rolls over,
// re-anchoring starting equity at the last observed equity.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Serialisable snapshot of the trading breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingBreakerState {
    pub starting_equity: f64,
    pub peak_equity: f64,
    pub last_equity: f64,
    pub consecutive_losses: u32,
    pub tripped: bool,
    #[serde(default)]
    pub trip_reason: Option<String>,
    pub current_date: String,
}

struct Inner {
    starting_equity: f64,
    peak_equity: f64,
    last_equity: f64,
    consecutive_losses: u32,
    tripped: bool,
    trip_reason: Option<String>,
    current_date: String,
}

pub struct TradingBreaker {
    state: RwLock<Inner>,
    max_daily_drawdown_pct: f64,
    max_consecutive_losses: u32,
}

impl TradingBreaker {
    pub fn new(max_daily_drawdown_pct: f64, max_consecutive_losses: u32) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self {
            state: RwLock::new(Inner {
                starting_equity: 0.0,
                peak_equity: 0.0,
                last_equity: 0.0,
                consecutive_losses: 0,
                tripped: false,
                trip_reason: None,
                current_date: today,
            }),
            max_daily_drawdown_pct,
            max_consecutive_losses,
        }
    }

    /// Anchor the day's starting equity. Called at session start and after a
    /// UTC date roll.
    pub fn set_starting_equity(&self, equity: f64) {
        let mut s = self.state.write();
        s.starting_equity = equity;
        s.peak_equity = equity;
        s.last_equity = equity;
        info!(starting_equity = equity, "trading breaker anchored");
    }

    /// Record the latest equity and, optionally, the PnL of a just-closed
    /// trade. Trips the breaker when a limit is breached.
    pub fn update_equity(&self, equity: f64, trade_pnl: Option<f64>) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.last_equity = equity;
        if equity > s.peak_equity {
            s.peak_equity = equity;
        }

        if let Some(pnl) = trade_pnl {
            if pnl >= 0.0 {
                s.consecutive_losses = 0;
            } else {
                s.consecutive_losses += 1;
            }
        }

        if s.tripped {
            return;
        }

        let drawdown_pct = if s.starting_equity > 0.0 {
            (s.starting_equity - equity) / s.starting_equity * 100.0
        } else {
            0.0
        };

        if drawdown_pct >= self.max_daily_drawdown_pct {
            s.tripped = true;
            s.trip_reason = Some(format!(
                "daily drawdown {:.2}% >= limit {:.2}%",
                drawdown_pct, self.max_daily_drawdown_pct
            ));
            warn!(
                drawdown_pct,
                limit_pct = self.max_daily_drawdown_pct,
                "trading breaker TRIPPED on drawdown"
            );
        } else if s.consecutive_losses >= self.max_consecutive_losses {
            s.tripped = true;
            s.trip_reason = Some(format!(
                "{} consecutive losses >= limit {}",
                s.consecutive_losses, self.max_consecutive_losses
            ));
            warn!(
                consecutive_losses = s.consecutive_losses,
                limit = self.max_consecutive_losses,
                "trading breaker TRIPPED on loss streak"
            );
        } else {
            debug!(
                equity,
                drawdown_pct,
                consecutive_losses = s.consecutive_losses,
                "trading breaker updated"
            );
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.maybe_reset_daily();
        self.state.read().tripped
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.state.read().trip_reason.clone()
    }

    /// Manual reset, clearing the trip and the loss streak.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.tripped = false;
        s.trip_reason = None;
        s.consecutive_losses = 0;
        s.peak_equity = s.last_equity;
        s.starting_equity = s.last_equity;
        info!("trading breaker reset (manual)");
    }

    pub fn snapshot(&self) -> TradingBreakerState {
        let s = self.state.read();
        TradingBreakerState {
            starting_equity: s.starting_equity,
            peak_equity: s.peak_equity,
            last_equity: s.last_equity,
            consecutive_losses: s.consecutive_losses,
            tripped: s.tripped,
            trip_reason: s.trip_reason.clone(),
            current_date: s.current_date.clone(),
        }
    }

    /// If the UTC calendar date changed since the last check, reset all daily
    /// state automatically.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Double-check after acquiring the write lock (another thread may
        // have already performed the reset).
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting trading breaker"
            );
            s.current_date = today;
            s.tripped = false;
            s.trip_reason = None;
            s.consecutive_losses = 0;
            s.starting_equity = s.last_equity;
            s.peak_equity = s.last_equity;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_daily_drawdown() {
        let tb = TradingBreaker::new(5.0, 100);
        tb.set_starting_equity(10000.0);

        tb.update_equity(9600.0, None);
        assert!(!tb.is_tripped());

        tb.update_equity(9500.0, None); // exactly 5%
        assert!(tb.is_tripped());
        assert!(tb.trip_reason().unwrap().contains("drawdown"));
    }

    #[test]
    fn trips_on_consecutive_losses_and_streak_resets_on_win() {
        let tb = TradingBreaker::new(90.0, 3);
        tb.set_starting_equity(10000.0);

        tb.update_equity(9990.0, Some(-10.0));
        tb.update_equity(9980.0, Some(-10.0));
        tb.update_equity(9990.0, Some(10.0)); // win resets streak
        tb.update_equity(9980.0, Some(-10.0));
        tb.update_equity(9970.0, Some(-10.0));
        assert!(!tb.is_tripped());

        tb.update_equity(9960.0, Some(-10.0));
        assert!(tb.is_tripped());
        assert!(tb.trip_reason().unwrap().contains("consecutive"));
    }

    #[test]
    fn stays_tripped_until_reset() {
        let tb = TradingBreaker::new(1.0, 100);
        tb.set_starting_equity(10000.0);
        tb.update_equity(9800.0, None);
        assert!(tb.is_tripped());

        // Recovery alone does not clear the trip.
        tb.update_equity(10100.0, None);
        assert!(tb.is_tripped());

        tb.reset();
        assert!(!tb.is_tripped());
        // Re-anchored at the latest equity.
        assert_eq!(tb.snapshot().starting_equity, 10100.0);
    }

    #[test]
    fn zero_pnl_counts_as_non_loss() {
        let tb = TradingBreaker::new(90.0, 2);
        tb.set_starting_equity(10000.0);
        tb.update_equity(10000.0, Some(-1.0));
        tb.update_equity(10000.0, Some(0.0));
        tb.update_equity(10000.0, Some(-1.0));
        assert!(!tb.is_tripped());
    }
}
