// =============================================================================
// Checkpoint task — periodic crash-recovery snapshots
// =============================================================================
//
// Every 60 seconds the circuit-breaker state, starting equity, and broker
// state go to disk. The file writes run on the blocking pool so serialization
// and fsync never stall the cooperative loop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use super::Session;

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

pub async fn checkpoint_task(session: Arc<Session>) -> Result<()> {
    loop {
        tokio::select! {
            _ = session.shutdown.wait() => break,
            _ = tokio::time::sleep(CHECKPOINT_INTERVAL) => {}
        }
        if session.shutdown.is_set() {
            break;
        }

        if let Err(e) = write_checkpoint(&session).await {
            let position = session
                .broker
                .position()
                .map(|p| p.side.to_string())
                .unwrap_or_else(|| "FLAT".to_string());
            warn!(error = %e, "checkpoint failed");
            let _ = session.event_log.append(
                "CheckpointError",
                json!({
                    "error": e.to_string(),
                    "symbol": session.config.symbol,
                    "loop_id": session.config.loop_id,
                    "position": position,
                    "open_orders_count": session.broker.working_orders().len(),
                    "interval": session.config.interval,
                }),
            );
        } else {
            info!("pulse checkpoint saved");
        }
    }
    Ok(())
}

/// One checkpoint, offloaded to the blocking pool.
pub async fn write_checkpoint(session: &Arc<Session>) -> Result<()> {
    let session = session.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        session
            .state_manager
            .set("circuit_breaker", session.circuit_breaker.snapshot());
        session
            .state_manager
            .set("starting_equity", *session.starting_equity.read());
        session
            .state_manager
            .set("trading_breaker", session.trading_breaker.snapshot());
        session.state_manager.save()?;
        session.broker.save_state()?;
        Ok(())
    })
    .await?
}
