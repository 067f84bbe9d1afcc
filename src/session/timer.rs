// =============================================================================
// Timer task — bounds the session to its configured duration
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::Session;

pub async fn timer_task(session: Arc<Session>) -> Result<()> {
    let duration = Duration::from_secs(session.config.duration_min * 60);

    tokio::select! {
        _ = session.shutdown.wait() => {}
        _ = tokio::time::sleep(duration) => {
            info!(duration_min = session.config.duration_min, "duration limit reached");
            session.request_shutdown("duration_limit");
        }
    }
    Ok(())
}
