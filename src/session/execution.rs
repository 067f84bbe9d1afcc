// =============================================================================
// Execution task — drains the order queue through the broker
// =============================================================================
//
// Consumes the execution queue with a one-second receive timeout so shutdown
// is always observed. For each order: the client id is reserved in the
// in-flight set, network latency is simulated (skipped in dry-run), and the
// broker evaluates the order against the candle that produced it plus the
// tick observed after the latency sleep.
//
// An id is in exactly one of `in_flight` or the broker's processed ring
// between dequeue and completion, never neither.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{ExecutionRequest, Session};
use crate::types::BrokerEvents;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn execution_task(session: Arc<Session>) -> Result<()> {
    while !session.shutdown.is_set() {
        let request = {
            let mut rx = session.execution_rx.lock().await;
            match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                Err(_) => continue, // timeout: re-check shutdown
                Ok(None) => break,  // channel closed
                Ok(Some(req)) => req,
            }
        };

        if session
            .kill_switch_fired
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            continue;
        }

        process_request(&session, request).await;
    }
    Ok(())
}

async fn process_request(session: &Arc<Session>, request: ExecutionRequest) {
    let client_order_id = request.order.client_order_id.clone();

    // Immediate id locking: a second copy of the same order in the queue is
    // dropped here, before any await point.
    if !client_order_id.is_empty() && !session.in_flight.lock().insert(client_order_id.clone()) {
        warn!(client_order_id = %client_order_id, "duplicate in-flight order skipped");
        return;
    }

    let outcome = run_order(session, &request).await;

    if !client_order_id.is_empty() {
        session.in_flight.lock().remove(&client_order_id);
    }

    if let Err(e) = outcome {
        let errors = session.record_error();
        warn!(error = %e, errors, "execution task error");
        let position = session
            .broker
            .position()
            .map(|p| p.side.to_string())
            .unwrap_or_else(|| "FLAT".to_string());
        let _ = session.event_log.append(
            "ExecutionTaskError",
            json!({
                "error": e.to_string(),
                "symbol": session.config.symbol,
                "loop_id": session.config.loop_id,
                "position": position,
                "open_orders_count": session.broker.working_orders().len(),
                "interval": session.config.interval,
            }),
        );
    }
}

async fn run_order(session: &Arc<Session>, request: &ExecutionRequest) -> Result<()> {
    if !request.order.go {
        return Ok(());
    }

    // Simulated network latency; dry runs execute instantly.
    if !session.config.dry_run && request.latency_ms > 0 {
        debug!(latency_ms = request.latency_ms, "simulating order latency");
        tokio::time::sleep(Duration::from_millis(request.latency_ms)).await;
    }

    // The tick observed after latency gives the realistic fill price.
    let tick = session.latest_tick();
    let events: BrokerEvents =
        session
            .broker
            .on_candle(&request.candle, Some(&request.order), tick.as_ref());

    for fill in &events.fills {
        info!(
            client_order_id = %fill.client_order_id,
            side = %fill.side,
            qty = fill.qty,
            price = fill.price,
            partial = fill.partial,
            "EXECUTION FILL"
        );
        session.record_trade();
    }
    for exit in &events.exits {
        info!(reason = %exit.reason, price = exit.price, pnl = exit.pnl, "EXECUTION EXIT");
        session.record_trade_result(exit.pnl);
    }
    for error in &events.errors {
        warn!(client_order_id = %request.order.client_order_id, error = %error, "order rejected");
    }

    if !session.circuit_breaker.allow_request() {
        warn!("error circuit breaker is OPEN");
        session.request_shutdown("circuit_breaker_open");
    }
    if session.trading_breaker.is_tripped() && !session.shutdown.is_set() {
        session.request_shutdown("trading_breaker_tripped");
    }

    if !session.config.dry_run {
        session
            .state_manager
            .set("circuit_breaker", session.circuit_breaker.snapshot());
        session.state_manager.save()?;
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
    use crate::types::{Candle, EntryType, Order, Side};
    use tempfile::tempdir;

    fn test_session() -> Arc<Session> {
        let dir = tempdir().unwrap().keep();
        let mut config = SessionConfig::default();
        config.state_dir = dir.clone();
        config.kill_file = dir.join("kill.txt");
        config.dry_run = true; // skip latency sleeps in tests
        Session::new(
            config,
            Arc::new(ReplayProvider::new(Vec::new())),
            Arc::new(HoldStrategy),
        )
        .unwrap()
    }

    fn request(id: &str) -> ExecutionRequest {
        ExecutionRequest {
            order: Order {
                go: true,
                side: Side::Long,
                entry_type: EntryType::Market,
                entry: 0.0,
                sl: 90.0,
                tp: 120.0,
                qty: 0.01,
                client_order_id: id.to_string(),
                equity: 10_000.0,
                risk_pct: 1.0,
                rr_min: 1.5,
                lot_step: 0.0,
                min_notional: 0.0,
                setup: Default::default(),
            },
            candle: Candle {
                ts: "2024-01-01T00:00:00Z".into(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1_000.0,
            },
            latency_ms: 0,
        }
    }

    #[tokio::test]
    async fn processed_order_fills_and_releases_in_flight_id() {
        let session = test_session();
        process_request(&session, request("ex-1")).await;

        assert!(session.broker.position().is_some());
        assert!(session.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn task_executes_and_stops_on_shutdown() {
        let session = test_session();
        session.execution_tx.send(request("ex-run-1")).await.unwrap();

        let handle = tokio::spawn(execution_task(session.clone()));
        // Give the task one loop turn to pick up the order.
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.request_shutdown("test_done");
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("task stopped")
            .unwrap()
            .unwrap();

        let pos = session.broker.position().expect("position opened");
        assert_eq!(pos.side, Side::Long);
        assert_eq!(session.trades.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn kill_switch_flag_skips_queued_orders() {
        let session = test_session();
        session
            .kill_switch_fired
            .store(true, std::sync::atomic::Ordering::SeqCst);
        session.execution_tx.send(request("ex-ks-1")).await.unwrap();

        let handle = tokio::spawn(execution_task(session.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.request_shutdown("test_done");
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(session.broker.position().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_already_in_flight_is_skipped() {
        let session = test_session();
        session.in_flight.lock().insert("ex-dup".to_string());
        process_request(&session, request("ex-dup")).await;
        assert!(session.broker.position().is_none());
        // The pre-existing reservation is untouched.
        assert!(session.in_flight.lock().contains("ex-dup"));
    }
}
