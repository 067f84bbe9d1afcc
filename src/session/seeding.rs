// =============================================================================
// Seeding — pre-load historical candles before the session goes live
// =============================================================================
//
// Up to five attempts spaced ten seconds apart, each wrapped in the error
// circuit breaker. A session that still has too little history after that
// starts degraded rather than not at all. After seeding, consecutive candle
// timestamps are checked against the interval and every gap is logged.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::DateTime;
use tracing::{error, info, warn};

use super::Session;
use crate::types::Candle;

const SEED_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(10);

pub async fn seed_historical_candles(session: &Arc<Session>) -> Result<()> {
    let min_history = session.config.min_history_bars;
    let mut seeded: Vec<Candle> = Vec::new();

    for attempt in 1..=SEED_ATTEMPTS {
        info!(attempt, total = SEED_ATTEMPTS, count = min_history, "seeding historical candles");
        match session
            .circuit_breaker
            .call(session.provider.history(min_history))
            .await
        {
            Ok(candles) => {
                seeded = candles;
                if seeded.len() >= min_history {
                    info!(candles = seeded.len(), "seed complete");
                    break;
                }
                warn!(
                    got = seeded.len(),
                    wanted = min_history,
                    "incomplete seed — retrying"
                );
            }
            Err(e) => warn!(attempt, error = %e, "seed attempt failed"),
        }

        if attempt < SEED_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    if seeded.len() < min_history {
        error!(
            got = seeded.len(),
            wanted = min_history,
            "DEGRADED_START: proceeding with partial history"
        );
    }

    if !seeded.is_empty() {
        let interval_secs = session.config.interval_secs()?;
        log_candle_gaps(&seeded, interval_secs);
        let mut candles = session.candles.write();
        for candle in seeded {
            candles.push_back(candle);
        }
    }
    Ok(())
}

/// Warn about every hole in the candle sequence larger than one interval.
fn log_candle_gaps(candles: &[Candle], interval_secs: u64) {
    for gap in detect_candle_gaps(candles, interval_secs) {
        warn!(
            missing = gap.missing_count,
            prev_ts = %gap.prev_ts,
            curr_ts = %gap.curr_ts,
            "GAP_DETECTED in seeded history"
        );
    }
}

#[derive(Debug, PartialEq)]
pub struct CandleGap {
    pub prev_ts: String,
    pub curr_ts: String,
    pub missing_count: u64,
}

/// Interval arithmetic over consecutive timestamps. Unparseable timestamps
/// are skipped rather than treated as gaps.
pub fn detect_candle_gaps(candles: &[Candle], interval_secs: u64) -> Vec<CandleGap> {
    let mut gaps = Vec::new();
    if interval_secs == 0 {
        return gaps;
    }
    for pair in candles.windows(2) {
        let (Some(prev), Some(curr)) = (parse_ts(&pair[0].ts), parse_ts(&pair[1].ts)) else {
            continue;
        };
        let delta = (curr - prev).num_seconds();
        if delta > interval_secs as i64 {
            let missing = (delta as u64 / interval_secs).saturating_sub(1);
            if missing > 0 {
                gaps.push(CandleGap {
                    prev_ts: pair[0].ts.clone(),
                    curr_ts: pair[1].ts.clone(),
                    missing_count: missing,
                });
            }
        }
    }
    gaps
}

fn parse_ts(ts: &str) -> Option<DateTime<chrono::Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
