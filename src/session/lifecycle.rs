// =============================================================================
// Session lifecycle — startup order, task supervision, graceful drain
// =============================================================================
//
// Startup: resolve starting equity (with the stale-drawdown guard), honor a
// restored-open circuit breaker, start the hardware watchdog thread, seed
// history, then spawn the cooperative tasks and wait on the shutdown signal.
//
// Shutdown is idempotent (first reason sticks) and drains in a fixed order:
// SessionStopped event, cancel working orders, a bounded wait for pending
// fills, drain the execution queue into the broker's working orders, cancel
// tasks, force-close any open position, broker shutdown under a 5 s cap,
// final state save, final metrics.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{
    checkpoint::checkpoint_task, equity_sentinel::equity_sentinel_task,
    execution::execution_task, funding::funding_task, heartbeat::heartbeat_task,
    kill_switch::kill_switch_task, market_data::market_data_task, seeding::seed_historical_candles,
    stale_data::stale_data_task, timer::timer_task, watchdog::spawn_hardware_watchdog,
    watchdog::watchdog_tick_task, Session, SessionResult, SessionStatus,
};

/// Cap on `broker.shutdown()` during the drain.
const BROKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one supervised trading session from start to orderly shutdown.
pub async fn run_session(session: Arc<Session>) -> Result<SessionResult> {
    sync_initial_state(&session);
    session.set_status(SessionStatus::Running);

    // A breaker restored OPEN from a previous crash keeps the session from
    // starting a fresh trading run.
    if !session.circuit_breaker.allow_request() {
        warn!("circuit breaker is OPEN at startup — it remains OPEN");
        session.request_shutdown("circuit_breaker_open");
    }

    // The watchdog thread must exist before anything can wedge the loop.
    session.touch_heartbeat();
    let _watchdog_thread = spawn_hardware_watchdog(session.clone());
    info!("hardware watchdog thread started");

    if !session.shutdown.is_set() {
        seed_historical_candles(&session).await?;
    }

    // Staleness is measured from "started listening", not from session
    // construction: seeding retries must not eat into the live-data budget.
    session.touch_data();

    let tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
        ("market_data", spawn_supervised(&session, "market_data", market_data_task(session.clone()))),
        ("watchdog_tick", spawn_supervised(&session, "watchdog_tick", watchdog_tick_task(session.clone()))),
        ("heartbeat", spawn_supervised(&session, "heartbeat", heartbeat_task(session.clone()))),
        ("timer", spawn_supervised(&session, "timer", timer_task(session.clone()))),
        ("kill_switch", spawn_supervised(&session, "kill_switch", kill_switch_task(session.clone()))),
        ("stale_data", spawn_supervised(&session, "stale_data", stale_data_task(session.clone()))),
        ("funding", spawn_supervised(&session, "funding", funding_task(session.clone()))),
        ("execution", spawn_supervised(&session, "execution", execution_task(session.clone()))),
        ("checkpoint", spawn_supervised(&session, "checkpoint", checkpoint_task(session.clone()))),
        ("equity_sentinel", spawn_supervised(&session, "equity_sentinel", equity_sentinel_task(session.clone()))),
    ];
    info!(tasks = tasks.len(), "session tasks launched");

    session.shutdown.wait().await;
    perform_shutdown(&session, tasks).await;

    let result = session.build_result();
    info!(
        stopped_reason = %result.stopped_reason,
        trades = result.trades,
        errors = result.errors,
        ending_equity = result.ending_equity,
        max_drawdown = result.max_drawdown,
        duration_sec = result.duration_sec,
        "session finished"
    );
    Ok(result)
}

/// Spawn a task whose failure counts against the error budget and requests
/// shutdown with reason `task_failed`.
fn spawn_supervised<F>(session: &Arc<Session>, name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(task = name, error = %e, "task failed");
            session.record_error();
            session.request_shutdown("task_failed");
        }
    })
}

/// The graceful drain. Public so embedders and tests can drive it directly.
pub async fn perform_shutdown(session: &Arc<Session>, tasks: Vec<(&'static str, JoinHandle<()>)>) {
    session.set_status(SessionStatus::ShuttingDown);
    let reason = session
        .shutdown
        .reason()
        .unwrap_or_else(|| "completed".to_string());
    info!(reason = %reason, "GRACEFUL SHUTDOWN INITIATED");

    // 1. One SessionStopped event (the log's content hash keeps it single).
    let _ = session.event_log.append(
        "SessionStopped",
        json!({
            "reason": reason,
            "errors": session.errors.load(std::sync::atomic::Ordering::SeqCst),
            "symbol": session.config.symbol,
            "interval": session.config.interval,
        }),
    );

    // 2. Cancel resting orders so nothing fills while we unwind.
    session.broker.cancel_all_open_orders();

    // 3. Bounded wait for fills already inside the broker.
    tokio::time::sleep(Duration::from_millis(session.config.drain_wait_ms)).await;

    // 4. Drain the execution queue: queued orders survive as persisted
    // working orders instead of dying with the process.
    {
        let mut rx = session.execution_rx.lock().await;
        let mut drained = 0usize;
        while let Ok(request) = rx.try_recv() {
            session.broker.push_working_order(&request.order);
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "pending orders drained into broker working orders");
        }
    }

    // 5. Cancel tasks; join errors are expected and suppressed.
    for (_, handle) in &tasks {
        handle.abort();
    }
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(task = name, error = %e, "task join error during shutdown");
            }
        }
    }

    // 6. Force-close any open position at the freshest price we have.
    if session.broker.position().is_some() {
        let price = session
            .latest_tick()
            .map(|t| t.last)
            .filter(|p| *p > 0.0)
            .or_else(|| session.candles.read().back().map(|c| c.close));
        match price {
            Some(price) if price > 0.0 => {
                warn!(price, "open position force-closed on shutdown");
                session.broker.close_all(price);
            }
            _ => warn!("open position left in place: no valid price to close at"),
        }
    }

    // 7. Broker shutdown under a hard cap.
    let broker = session.broker.clone();
    let shutdown_result = tokio::time::timeout(
        BROKER_SHUTDOWN_TIMEOUT,
        tokio::task::spawn_blocking(move || broker.shutdown()),
    )
    .await;
    match shutdown_result {
        Err(_) => warn!(timeout_secs = BROKER_SHUTDOWN_TIMEOUT.as_secs(), "broker shutdown timed out"),
        Ok(Err(e)) => error!(error = %e, "broker shutdown panicked"),
        Ok(Ok(())) => {}
    }

    // 8. Final unified state.
    session
        .state_manager
        .set("circuit_breaker", session.circuit_breaker.snapshot());
    session
        .state_manager
        .set("starting_equity", *session.starting_equity.read());
    session
        .state_manager
        .set("trading_breaker", session.trading_breaker.snapshot());
    if let Err(e) = session.state_manager.save() {
        error!(error = %e, "failed to save unified state on shutdown");
    } else {
        info!("final unified state saved");
    }

    session.set_status(SessionStatus::Stopped);
    info!("session shutdown complete");
}

/// Resolve the session's starting equity against persisted state.
///
/// Restore order: unified state, then broker state, then the configured
/// balance. The stale-drawdown guard: a flat broker with no working orders
/// whose persisted drawdown already exceeds the daily limit would trip the
/// breaker instantly, so starting equity re-anchors at current equity.
fn sync_initial_state(session: &Arc<Session>) -> f64 {
    let configured = session.config.starting_balance;
    let restored: Option<f64> = session.state_manager.get_as("starting_equity");
    let mut starting = restored
        .or_else(|| session.broker.starting_equity())
        .unwrap_or(configured);
    if restored.is_some() {
        info!(starting_equity = starting, "starting equity restored from state");
    }
    session.broker.set_starting_equity(starting);

    let flat = session.broker.position().is_none() && session.broker.working_orders().is_empty();
    if flat && starting > 0.0 {
        let current = session.broker.current_equity();
        let drawdown_pct = (starting - current) / starting * 100.0;
        if drawdown_pct >= session.config.max_daily_drawdown_pct {
            warn!(
                starting_equity = starting,
                current_equity = current,
                drawdown_pct,
                "STARTUP_DRAWDOWN_RESET: re-anchoring starting equity after stale drawdown"
            );
            starting = current;
            session.broker.set_starting_equity(starting);
        }
    }

    *session.starting_equity.write() = starting;
    session.trading_breaker.set_starting_equity(starting);
    session.state_manager.set("starting_equity", starting);
    if let Err(e) = session.state_manager.save() {
        error!(error = %e, "failed to persist starting equity");
    }
    starting
}
