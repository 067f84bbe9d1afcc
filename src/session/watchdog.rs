// =============================================================================
// Watchdogs — 50 ms tick-exit sentinel + independent hardware watchdog
// =============================================================================
//
// The tick watchdog is a cooperative task: every 50 ms it pushes the latest
// tick through the broker so SL/TP/trail exits fire between candles.
//
// The hardware watchdog is an OS thread, deliberately outside the tokio
// runtime: if the cooperative loop wedges (deadlock, CPU-bound stall), the
// thread still sees the frozen heartbeat stamp and force-exits the process
// after a short grace period. It also enforces the RSS memory ceiling from
// `LA_MAX_MEMORY_MB`.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use sysinfo::{Pid, System};
use tracing::{error, info, warn};

use super::Session;

/// Heartbeat age at which the loop is declared frozen.
const FREEZE_THRESHOLD_SECS: f64 = 60.0;
/// Grace given to the graceful path before the hard exit.
const FORCE_EXIT_GRACE: Duration = Duration::from_secs(5);
/// Default RSS ceiling when `LA_MAX_MEMORY_MB` is unset.
const DEFAULT_MAX_MEMORY_MB: f64 = 1500.0;

const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative 50 ms sentinel: intra-candle exits off the latest tick.
pub async fn watchdog_tick_task(session: Arc<Session>) -> Result<()> {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    while !session.shutdown.is_set() {
        ticker.tick().await;

        let Some(tick) = session.latest_tick() else {
            continue;
        };
        if session.broker.position().is_none() {
            continue;
        }

        let events = session.broker.on_tick(&tick);
        for exit in &events.exits {
            info!(
                reason = %exit.reason,
                price = exit.price,
                pnl = exit.pnl,
                "REALTIME_TICK_EXIT"
            );
            session.record_trade_result(exit.pnl);
            let _ = session.event_log.append(
                "WatchdogExit",
                json!({
                    "tick": tick,
                    "reason": exit.reason.to_string(),
                    "side": exit.side,
                    "qty": exit.qty,
                    "entry": exit.entry,
                    "price": exit.price,
                    "pnl": exit.pnl,
                }),
            );
        }
    }
    Ok(())
}

/// Spawn the hardware watchdog on a dedicated OS thread. The only shared
/// datum with the cooperative loop is the atomic heartbeat stamp.
pub fn spawn_hardware_watchdog(session: Arc<Session>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("hardware-watchdog".to_string())
        .spawn(move || hardware_watchdog_loop(session))
        .expect("failed to spawn hardware watchdog thread")
}

fn hardware_watchdog_loop(session: Arc<Session>) {
    let max_memory_mb = std::env::var("LA_MAX_MEMORY_MB")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(DEFAULT_MAX_MEMORY_MB);
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();

    while !session.shutdown.is_set() {
        let age = session.heartbeat_age_secs();
        if age > FREEZE_THRESHOLD_SECS {
            error!(age_secs = age, "WATCHDOG_FATAL: main loop frozen");
            session.request_shutdown("watchdog_frozen");
            std::thread::sleep(FORCE_EXIT_GRACE);
            std::process::exit(1);
        }

        system.refresh_process(pid);
        if let Some(process) = system.process(pid) {
            let rss_mb = process.memory() as f64 / 1024.0 / 1024.0;
            if rss_mb > max_memory_mb {
                error!(
                    rss_mb,
                    limit_mb = max_memory_mb,
                    "CRITICAL: memory limit exceeded — force exiting"
                );
                session.request_shutdown("memory_limit");
                std::process::exit(1);
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }
    warn!("hardware watchdog observed shutdown; thread exiting");
}
