// =============================================================================
// Safety gates — kill switch, order rate limit, hard position limits
// =============================================================================
//
// The kill switch is out-of-band: either `LA_KILL_SWITCH=TRUE` in the
// environment or the presence of a `kill.txt` file. The broker consults it on
// every order; the kill-switch task polls it to stop the whole session.
//
// The rate limiter is a sliding one-minute window over order submission
// times. Unlike the weight counters an exchange reports back, everything here
// is enforced locally before an order can mutate state.
// =============================================================================

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::BrokerError;

/// Hard cap on order submissions per sliding minute.
pub const MAX_ORDERS_PER_MINUTE: usize = 10;
/// Hard cap on a single order's notional value, USD.
pub const MAX_POSITION_SIZE_USD: f64 = 100_000.0;

/// True when the out-of-band kill switch is engaged.
pub fn kill_switch_engaged(kill_file: &Path) -> bool {
    if std::env::var("LA_KILL_SWITCH").map(|v| v == "TRUE").unwrap_or(false) {
        return true;
    }
    kill_file.exists()
}

/// Sliding-window rate limiter over order submissions.
pub struct OrderRateLimiter {
    window: Duration,
    max_orders: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl OrderRateLimiter {
    pub fn new(max_orders: usize, window: Duration) -> Self {
        Self {
            window,
            max_orders,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve a slot for one order, or reject when the window is full.
    pub fn try_acquire(&self) -> Result<(), BrokerError> {
        let mut stamps = self.timestamps.lock();
        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) > self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        if stamps.len() >= self.max_orders {
            warn!(
                count = stamps.len(),
                limit = self.max_orders,
                "order blocked — rate limit window full"
            );
            return Err(BrokerError::RateLimitExceeded {
                count: stamps.len(),
                limit: self.max_orders,
            });
        }
        stamps.push_back(now);
        Ok(())
    }

    pub fn in_window(&self) -> usize {
        let mut stamps = self.timestamps.lock();
        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) > self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        stamps.len()
    }
}

impl Default for OrderRateLimiter {
    fn default() -> Self {
        Self::new(MAX_ORDERS_PER_MINUTE, Duration::from_secs(60))
    }
}
