// =============================================================================
// Session — shared state for one supervised trading run
// =============================================================================
//
// The single source of truth the cooperative tasks share. Ownership follows
// three lines: the broker owns position/orders/equity, the StateManager owns
// the on-disk snapshot, and this struct owns everything runtime-scoped (task
// counters, the shutdown signal, the market-data caches).
//
// `latest_tick` and `last_data_ms` are written only by the market-data task;
// everyone else reads. `last_heartbeat_ms` is a plain atomic because the
// hardware watchdog reads it from an OS thread outside the runtime.
// =============================================================================

pub mod checkpoint;
pub mod equity_sentinel;
pub mod execution;
pub mod funding;
pub mod heartbeat;
pub mod kill_switch;
pub mod lifecycle;
pub mod market_data;
pub mod seeding;
pub mod stale_data;
pub mod timer;
pub mod watchdog;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::broker::{build_broker, Broker};
use crate::circuit_breaker::CircuitBreaker;
use crate::events::EventLog;
use crate::provider::Provider;
use crate::risk::TradingBreaker;
use crate::session_config::SessionConfig;
use crate::state_manager::StateManager;
use crate::strategy::Strategy;
use crate::types::{Candle, Order, Tick};

/// Task exceptions tolerated before the session gives up.
pub const MAX_ERRORS_PER_SESSION: u32 = 20;
/// Bounded candle history kept in memory.
pub const MAX_CANDLE_BUFFER: usize = 2_000;
/// Capacity of the execution queue.
const EXECUTION_QUEUE_CAPACITY: usize = 256;

/// One queued order together with the candle that produced it.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub order: Order,
    pub candle: Candle,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Final accounting of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub iterations: u64,
    pub trades: u64,
    pub errors: u32,
    pub starting_equity: f64,
    pub ending_equity: f64,
    pub duration_sec: f64,
    pub max_drawdown: f64,
    pub stopped_reason: String,
}

/// Process-scoped cancellation: the first reason sticks, every task polls or
/// awaits it at its suspension points.
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
    reason: Mutex<Option<String>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
            reason: Mutex::new(None),
        }
    }

    /// Request shutdown. Returns true when this call was the first.
    pub fn request(&self, reason: &str) -> bool {
        let mut slot = self.reason.lock();
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason.to_string());
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolve when shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

pub struct Session {
    pub config: SessionConfig,
    pub provider: Arc<dyn Provider>,
    pub strategy: Arc<dyn Strategy>,
    pub broker: Arc<dyn Broker>,
    pub state_manager: Arc<StateManager>,
    pub event_log: Arc<EventLog>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub trading_breaker: Arc<TradingBreaker>,
    pub shutdown: ShutdownSignal,

    // ── Market data (written only by market_data_task) ──────────────────
    pub candles: RwLock<VecDeque<Candle>>,
    pub latest_tick: RwLock<Option<Tick>>,
    last_data_ms: AtomicU64,

    // ── Liveness (read by the hardware watchdog OS thread) ──────────────
    last_heartbeat_ms: AtomicU64,
    epoch: Instant,

    // ── Execution pipeline ──────────────────────────────────────────────
    pub execution_tx: mpsc::Sender<ExecutionRequest>,
    pub execution_rx: tokio::sync::Mutex<mpsc::Receiver<ExecutionRequest>>,
    /// Order ids between dequeue and broker completion. An id lives in
    /// exactly one of this set or the broker's processed ring.
    pub in_flight: Mutex<HashSet<String>>,

    // ── Counters & flags ────────────────────────────────────────────────
    pub iterations: AtomicU64,
    pub trades: AtomicU64,
    pub errors: AtomicU32,
    pub kill_switch_fired: AtomicBool,
    pub status: RwLock<SessionStatus>,
    pub starting_equity: RwLock<f64>,
    pub max_drawdown: RwLock<f64>,
}

impl Session {
    /// Build a session from validated config plus its external collaborators.
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn Provider>,
        strategy: Arc<dyn Strategy>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid session config")?;

        let event_log = Arc::new(EventLog::new(&config.state_dir)?);
        let state_manager = Arc::new(StateManager::new(&config.state_dir)?);
        let broker = build_broker(&config, event_log.clone())?;
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            config.breaker_max_failures,
            config.breaker_reset_timeout_secs,
        ));
        if let Some(snapshot) = state_manager.get_as("circuit_breaker") {
            circuit_breaker.restore(&snapshot);
        }
        let trading_breaker = Arc::new(TradingBreaker::new(
            config.max_daily_drawdown_pct,
            config.max_consecutive_losses,
        ));

        let (execution_tx, execution_rx) = mpsc::channel(EXECUTION_QUEUE_CAPACITY);
        let starting_balance = config.starting_balance;

        info!(
            symbol = %config.symbol,
            interval = %config.interval,
            mode = %config.execution_mode,
            loop_id = %config.loop_id,
            "session constructed"
        );

        Ok(Arc::new(Self {
            config,
            provider,
            strategy,
            broker,
            state_manager,
            event_log,
            circuit_breaker,
            trading_breaker,
            shutdown: ShutdownSignal::new(),
            candles: RwLock::new(VecDeque::with_capacity(MAX_CANDLE_BUFFER)),
            latest_tick: RwLock::new(None),
            last_data_ms: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            execution_tx,
            execution_rx: tokio::sync::Mutex::new(execution_rx),
            in_flight: Mutex::new(HashSet::new()),
            iterations: AtomicU64::new(0),
            trades: AtomicU64::new(0),
            errors: AtomicU32::new(0),
            kill_switch_fired: AtomicBool::new(false),
            status: RwLock::new(SessionStatus::Idle),
            starting_equity: RwLock::new(starting_balance),
            max_drawdown: RwLock::new(0.0),
        }))
    }

    /// Milliseconds since the session epoch (monotonic).
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn touch_data(&self) {
        self.last_data_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn data_age_secs(&self) -> f64 {
        let last = self.last_data_ms.load(Ordering::Relaxed);
        (self.now_ms().saturating_sub(last)) as f64 / 1000.0
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn heartbeat_age_secs(&self) -> f64 {
        let last = self.last_heartbeat_ms.load(Ordering::Relaxed);
        (self.now_ms().saturating_sub(last)) as f64 / 1000.0
    }

    pub fn request_shutdown(&self, reason: &str) {
        if self.shutdown.request(reason) {
            warn!(reason, "shutdown requested");
        }
    }

    /// Count one task error; requests shutdown once the budget is exhausted.
    pub fn record_error(&self) -> u32 {
        let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if errors >= MAX_ERRORS_PER_SESSION && !self.shutdown.is_set() {
            self.request_shutdown("error_budget");
        }
        errors
    }

    pub fn record_trade(&self) {
        self.trades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    /// Record a closed-trade PnL in the trading breaker and escalate a trip
    /// to a shutdown request.
    pub fn record_trade_result(&self, pnl: f64) {
        self.record_trade();
        self.trading_breaker
            .update_equity(self.broker.current_equity(), Some(pnl));
        if self.trading_breaker.is_tripped() && !self.shutdown.is_set() {
            self.request_shutdown("trading_breaker_tripped");
        }
    }

    /// Track peak-to-trough equity for the final report.
    pub fn update_drawdown(&self, total_equity: f64) {
        let starting = *self.starting_equity.read();
        if starting <= 0.0 {
            return;
        }
        let dd = (starting - total_equity) / starting;
        let mut max_dd = self.max_drawdown.write();
        if dd > *max_dd {
            *max_dd = dd;
        }
    }

    /// Snapshot of recent candles for the strategy callback.
    pub fn candles_snapshot(&self) -> Vec<Candle> {
        self.candles.read().iter().cloned().collect()
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.latest_tick.read().clone()
    }

    pub fn build_result(&self) -> SessionResult {
        SessionResult {
            iterations: self.iterations.load(Ordering::Relaxed),
            trades: self.trades.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::SeqCst),
            starting_equity: *self.starting_equity.read(),
            ending_equity: self.broker.current_equity(),
            duration_sec: self.epoch.elapsed().as_secs_f64(),
            max_drawdown: *self.max_drawdown.read(),
            stopped_reason: self
                .shutdown
                .reason()
                .unwrap_or_else(|| "completed".to_string()),
        }
    }
}
