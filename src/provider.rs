// =============================================================================
// Provider interface — market data consumed by the session runtime
// =============================================================================
//
// The engine never talks to an exchange directly: it consumes this trait.
// Real implementations (exchange WS/REST clients) live outside this crate.
// `ReplayProvider` feeds a scripted event sequence and backs dry runs and the
// test suite.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, MarketEvent};

/// Exchange-published contract metadata for the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub min_notional: f64,
}

/// A source of live market events and historical candles.
///
/// `listen` yields candles and ticks in the provider's own order; the
/// ingestion task preserves that order. `history` may fail and is retried by
/// the seeding step. A provider without funding data reports a zero rate.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn listen(&self) -> Result<BoxStream<'static, MarketEvent>>;

    async fn history(&self, n: usize) -> Result<Vec<Candle>>;

    async fn funding_rate(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo>;
}

// =============================================================================
// ReplayProvider — scripted feed for dry runs and tests
// =============================================================================

pub struct ReplayProvider {
    events: Mutex<Vec<MarketEvent>>,
    history: Vec<Candle>,
    funding_rate: f64,
    /// Pacing between replayed events; zero replays as fast as possible.
    event_delay: Duration,
    /// Number of leading `history()` calls that fail, for retry paths.
    history_failures: AtomicU32,
}

impl ReplayProvider {
    pub fn new(events: Vec<MarketEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            history: Vec::new(),
            funding_rate: 0.0,
            event_delay: Duration::ZERO,
            history_failures: AtomicU32::new(0),
        }
    }

    pub fn with_history(mut self, history: Vec<Candle>) -> Self {
        self.history = history;
        self
    }

    pub fn with_funding_rate(mut self, rate: f64) -> Self {
        self.funding_rate = rate;
        self
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Make the first `n` calls to `history()` fail.
    pub fn failing_history_calls(self, n: u32) -> Self {
        self.history_failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Provider for ReplayProvider {
    async fn listen(&self) -> Result<BoxStream<'static, MarketEvent>> {
        let events = std::mem::take(&mut *self.events.lock());
        let delay = self.event_delay;
        let stream = stream::iter(events).then(move |ev| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ev
        });
        Ok(stream.boxed())
    }

    async fn history(&self, n: usize) -> Result<Vec<Candle>> {
        let remaining = self.history_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.history_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("scripted history failure ({remaining} remaining)");
        }
        let start = self.history.len().saturating_sub(n);
        Ok(self.history[start..].to_vec())
    }

    async fn funding_rate(&self) -> Result<f64> {
        Ok(self.funding_rate)
    }

    async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo> {
        Ok(InstrumentInfo {
            tick_size: 0.1,
            lot_size: 0.001,
            min_qty: 0.001,
            max_qty: 1_000.0,
            min_notional: 5.0,
        })
    }
}
