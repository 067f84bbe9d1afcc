// =============================================================================
// Sentinel Bot — Main Entry Point
// =============================================================================
//
// Runs one supervised paper-trading session over a replayed market feed.
// Live exchange connectivity plugs in behind the Provider trait and is not
// part of this build.
//
// Exit codes: 0 normal, 1 error, 99 kill switch.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod circuit_breaker;
mod events;
mod provider;
mod risk;
mod safety;
mod session;
mod session_config;
mod state_manager;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::provider::ReplayProvider;
use crate::session::lifecycle::run_session;
use crate::session::Session;
use crate::session_config::SessionConfig;
use crate::strategy::HoldStrategy;
use crate::types::MarketEvent;

const KILL_SWITCH_EXIT_CODE: i32 = 99;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Sentinel Bot — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    match run().await {
        Ok(kill_switch_fired) => {
            if kill_switch_fired {
                std::process::exit(KILL_SWITCH_EXIT_CODE);
            }
        }
        Err(e) => {
            error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<bool> {
    let config = config_from_env()?;
    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        duration_min = config.duration_min,
        mode = %config.execution_mode,
        dry_run = config.dry_run,
        state_dir = %config.state_dir.display(),
        "session configured"
    );

    let replay_file = std::env::var("LA_REPLAY_FILE")
        .context("LA_REPLAY_FILE must point at a JSONL market-event replay file")?;
    let provider = Arc::new(load_replay_provider(&PathBuf::from(replay_file))?);

    let session = Session::new(config, provider, Arc::new(HoldStrategy))?;
    let result = run_session(session.clone()).await?;

    info!(
        stopped_reason = %result.stopped_reason,
        trades = result.trades,
        errors = result.errors,
        starting_equity = result.starting_equity,
        ending_equity = result.ending_equity,
        "final session result"
    );

    Ok(session
        .kill_switch_fired
        .load(std::sync::atomic::Ordering::SeqCst))
}

/// Defaults with `LA_*` environment overrides, validated by `Session::new`.
fn config_from_env() -> Result<SessionConfig> {
    let mut config = SessionConfig::default();

    if let Ok(symbol) = std::env::var("LA_SYMBOL") {
        config.symbol = symbol.trim().to_uppercase();
    }
    if let Ok(interval) = std::env::var("LA_INTERVAL") {
        config.interval = interval.trim().to_string();
    }
    if let Ok(v) = std::env::var("LA_DURATION_MIN") {
        config.duration_min = v.parse().context("LA_DURATION_MIN must be an integer")?;
    }
    if let Ok(v) = std::env::var("LA_STARTING_BALANCE") {
        config.starting_balance = v.parse().context("LA_STARTING_BALANCE must be a number")?;
    }
    if let Ok(v) = std::env::var("LA_STATE_DIR") {
        config.state_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LA_DRY_RUN") {
        config.dry_run = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = std::env::var("LA_STALE_TIMEOUT_SECS") {
        config.stale_timeout_secs = v.parse().context("LA_STALE_TIMEOUT_SECS must be an integer")?;
    }
    Ok(config)
}

/// Load a JSONL file of `MarketEvent` lines into a replay provider.
fn load_replay_provider(path: &PathBuf) -> Result<ReplayProvider> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replay file {}", path.display()))?;
    let mut events = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: MarketEvent = serde_json::from_str(line)
            .with_context(|| format!("bad market event on line {} of {}", idx + 1, path.display()))?;
        events.push(event);
    }
    info!(events = events.len(), path = %path.display(), "replay feed loaded");
    Ok(ReplayProvider::new(events))
}
