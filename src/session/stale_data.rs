// =============================================================================
// Stale-data task — shuts the session down when the feed goes quiet
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::Session;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub async fn stale_data_task(session: Arc<Session>) -> Result<()> {
    let timeout_secs = session.config.stale_timeout_secs as f64;
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);

    while !session.shutdown.is_set() {
        ticker.tick().await;
        let age = session.data_age_secs();
        if age > timeout_secs {
            warn!(
                age_secs = age,
                timeout_secs,
                "no market data within the stale timeout"
            );
            session.request_shutdown("stale_data");
            break;
        }
    }
    Ok(())
}
