// =============================================================================
// Funding task — applies funding at the 8-hour windows
// =============================================================================
//
// Funding settles at 00:00, 08:00, and 16:00 UTC, exactly at minute zero.
// The latch on the last applied hour guarantees at most one application per
// window even though the task polls every 30 seconds; it clears once the
// clock leaves minute zero.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Timelike, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Session;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const FUNDING_HOURS: [u32; 3] = [0, 8, 16];

pub async fn funding_task(session: Arc<Session>) -> Result<()> {
    // Avoid an instant charge when the session starts inside a window.
    let now = Utc::now();
    let mut last_funding_hour: Option<u32> = if now.minute() == 0 {
        Some(now.hour())
    } else {
        None
    };

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    while !session.shutdown.is_set() {
        ticker.tick().await;

        let now = Utc::now();
        let in_window = FUNDING_HOURS.contains(&now.hour())
            && now.minute() == 0
            && last_funding_hour != Some(now.hour());

        if in_window {
            info!(hour = now.hour(), "funding window detected");
            match session.circuit_breaker.call(session.provider.funding_rate()).await {
                Ok(rate) => {
                    let ts = now.to_rfc3339();
                    if let Some(ev) = session.broker.apply_funding(rate, &ts) {
                        let _ = session
                            .event_log
                            .append("Funding", json!({
                                "rate": ev.rate,
                                "notional": ev.notional,
                                "charge": ev.charge,
                                "ts": ev.ts,
                            }));
                    } else {
                        debug!(rate, "no open position — funding skipped");
                    }
                }
                Err(e) => warn!(error = %e, "failed to fetch funding rate"),
            }
            last_funding_hour = Some(now.hour());
        }

        if now.minute() != 0 {
            last_funding_hour = None;
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // The wall-clock window itself is exercised indirectly; these tests pin
    // the latch arithmetic the loop depends on.

    #[test]
    fn funding_hours_are_the_three_utc_windows() {
        assert_eq!(FUNDING_HOURS, [0, 8, 16]);
        for h in [1, 7, 9, 15, 17, 23] {
            assert!(!FUNDING_HOURS.contains(&h));
        }
    }

    #[test]
    fn latch_blocks_repeat_application_within_the_same_hour() {
        let mut last: Option<u32> = None;

        let fires = |hour: u32, minute: u32, last: &Option<u32>| {
            FUNDING_HOURS.contains(&hour) && minute == 0 && *last != Some(hour)
        };

        // 08:00, first poll: fires and latches.
        assert!(fires(8, 0, &last));
        last = Some(8);
        // 08:00, second poll 30 s later: latched.
        assert!(!fires(8, 0, &last));
        // 08:01: latch clears.
        last = None;
        assert!(!fires(8, 1, &last));
        // 16:00: next window fires.
        assert!(fires(16, 0, &last));
    }
}
