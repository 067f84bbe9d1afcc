// =============================================================================
// Equity sentinel — real-time hard stop on total account equity
// =============================================================================
//
// Every 5 seconds: total equity = realized equity + unrealized PnL at the
// latest tick. Below 80% of the session's starting equity the sentinel
// engages the global kill switch, force-closes the position at the current
// price, and requests shutdown. It also maintains the max-drawdown figure
// for the final report.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use super::Session;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Fraction of starting equity below which the session hard-stops.
const HARD_STOP_FRACTION: f64 = 0.8;

pub async fn equity_sentinel_task(session: Arc<Session>) -> Result<()> {
    let starting_equity = *session.starting_equity.read();
    let hard_stop = starting_equity * HARD_STOP_FRACTION;
    info!(hard_stop, "equity sentinel active");

    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    while !session.shutdown.is_set() {
        ticker.tick().await;

        let price = session.latest_tick().map(|t| t.last).unwrap_or(0.0);
        let unrealized = if price > 0.0 {
            session.broker.unrealized_pnl(price)
        } else {
            0.0
        };
        let total_equity = session.broker.current_equity() + unrealized;
        session.update_drawdown(total_equity);

        if total_equity < hard_stop {
            error!(
                total_equity,
                hard_stop,
                "HARD STOP BREACHED — engaging kill switch"
            );
            std::env::set_var("LA_KILL_SWITCH", "TRUE");
            if price > 0.0 {
                session.broker.close_all(price);
            }
            session.request_shutdown("hard_stop_breached");
            break;
        }
    }
    Ok(())
}
