// =============================================================================
// Heartbeat task — liveness stamp + heartbeat.json
// =============================================================================
//
// Every second: refresh the monotonic heartbeat stamp the hardware watchdog
// reads, and write a small JSON liveness file for external monitors. Once a
// minute an `AsyncHeartbeat` event goes to the event log.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::Session;
use crate::state_manager::atomic_write_json;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Heartbeats between `AsyncHeartbeat` events.
const EVENT_EVERY_BEATS: u64 = 60;

/// Shape of `heartbeat.json`.
#[derive(Debug, Serialize)]
struct HeartbeatFile {
    unix_ts: f64,
    last_updated_ts: f64,
    price: f64,
    equity: f64,
    position_side: String,
}

pub async fn heartbeat_task(session: Arc<Session>) -> Result<()> {
    let path = session.config.heartbeat_path();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut beats: u64 = 0;

    while !session.shutdown.is_set() {
        ticker.tick().await;
        session.touch_heartbeat();
        beats += 1;

        let price = session
            .latest_tick()
            .map(|t| t.last)
            .or_else(|| session.candles.read().back().map(|c| c.close))
            .unwrap_or(0.0);
        let equity = session.broker.current_equity();
        let position_side = session
            .broker
            .position()
            .map(|p| p.side.to_string())
            .unwrap_or_else(|| "FLAT".to_string());

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let file = HeartbeatFile {
            unix_ts: now,
            last_updated_ts: now,
            price,
            equity,
            position_side: position_side.clone(),
        };
        if let Err(e) = atomic_write_json(&path, &file) {
            debug!(error = %e, "heartbeat file write failed");
        }

        if beats % EVENT_EVERY_BEATS == 0 {
            let _ = session.event_log.append(
                "AsyncHeartbeat",
                json!({
                    "beats": beats,
                    "price": price,
                    "equity": equity,
                    "position_side": position_side,
                }),
            );
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
    async fn heartbeat_writes_file_and_stamps_liveness() {
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

        let handle = tokio::spawn(heartbeat_task(session.clone()));
        // interval() fires immediately, so one short sleep suffices.
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.request_shutdown("test_done");
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(session.heartbeat_age_secs() < 5.0);
        let content = std::fs::read_to_string(session.config.heartbeat_path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["position_side"], "FLAT");
        assert_eq!(parsed["equity"], 10_000.0);
        assert!(parsed["unix_ts"].as_f64().unwrap() > 0.0);
    }
}
