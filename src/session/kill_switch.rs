// =============================================================================
// Kill-switch task — out-of-band emergency stop
// =============================================================================
//
// Polls for `kill.txt` or `LA_KILL_SWITCH=TRUE` twice a second. On trigger:
// remove the file (it is a one-shot signal), flag the runner so the process
// exits with code 99, and request shutdown.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::Session;
use crate::safety::kill_switch_engaged;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn kill_switch_task(session: Arc<Session>) -> Result<()> {
    let kill_file = session.config.kill_file.clone();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    while !session.shutdown.is_set() {
        ticker.tick().await;
        if kill_switch_engaged(&kill_file) {
            let reason = if kill_file.exists() {
                "kill.txt detected"
            } else {
                "LA_KILL_SWITCH=TRUE"
            };
            warn!(reason, "KILL SWITCH ACTIVATED");
            session.kill_switch_fired.store(true, Ordering::SeqCst);
            session.request_shutdown("kill_switch");
            if kill_file.exists() {
                let _ = std::fs::remove_file(&kill_file);
            }
            break;
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
    use crate::provider::ReplayProvider;
    use crate::session_config::SessionConfig;
    use crate::strategy::HoldStrategy;
    use tempfile::tempdir;

    #[tokio::test]
    async fn kill_file_triggers_shutdown_and_is_removed() {
        let dir = tempdir().unwrap().keep();
        let mut config = SessionConfig::default();
        config.state_dir = dir.clone();
        config.kill_file = dir.join("kill.txt");
        let session = Session::new(
            config,
            Arc::new(ReplayProvider::new(Vec::new())),
            Arc::new(HoldStrategy),
        )
        .unwrap();

        let handle = tokio::spawn(kill_switch_task(session.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&session.config.kill_file, "halt").unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("kill switch observed within the poll interval")
            .unwrap()
            .unwrap();

        assert_eq!(session.shutdown.reason().as_deref(), Some("kill_switch"));
        assert!(session.kill_switch_fired.load(Ordering::SeqCst));
        assert!(!session.config.kill_file.exists());
    }
}
