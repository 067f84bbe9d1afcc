// =============================================================================
// Error Circuit Breaker — CLOSED → OPEN → HALF_OPEN state machine
// =============================================================================
//
// Guards flaky external calls (provider history, funding fetches). After
// `max_failures` consecutive failures the breaker opens and every call fails
// fast until `reset_timeout` has elapsed; the next call then probes in
// HALF_OPEN. A probe success closes the breaker and resets the counter, a
// probe failure re-opens it with a fresh timestamp.
//
// The state snapshot is persisted through the StateManager so a restored
// session starts with the breaker it crashed with.
// =============================================================================

use std::future::Future;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Persisted shape of the breaker, written at every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub last_failure_ts: Option<f64>,
}

/// Outcome of [`CircuitBreaker::call`]: the distinguished fail-fast error
/// when the breaker is open, or the wrapped call's own error.
#[derive(Debug)]
pub enum CircuitError<E> {
    Open,
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "circuit open"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    /// Unix seconds of the most recent failure.
    last_failure_ts: Option<f64>,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    max_failures: u32,
    reset_timeout_secs: f64,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout_secs: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure_ts: None,
            }),
            max_failures,
            reset_timeout_secs,
        }
    }

    fn now_secs() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    /// Whether a request may proceed. In OPEN this transitions to HALF_OPEN
    /// once the reset timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_ts
                    .map(|ts| Self::now_secs() - ts)
                    .unwrap_or(f64::INFINITY);
                if elapsed > self.reset_timeout_secs {
                    info!(elapsed_secs = elapsed, "circuit breaker probing: OPEN -> HALF_OPEN");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(from = %inner.state, "circuit breaker recovered: -> CLOSED");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure_ts = Some(Self::now_secs());
        let should_open = inner.state == BreakerState::HalfOpen
            || inner.failures >= self.max_failures;
        if should_open && inner.state != BreakerState::Open {
            warn!(
                failures = inner.failures,
                max_failures = self.max_failures,
                "circuit breaker tripped: -> OPEN"
            );
            inner.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `fut` under the breaker: fail fast when open, otherwise record the
    /// outcome.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, CircuitError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return Err(CircuitError::Open);
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            last_failure_ts: inner.last_failure_ts,
        }
    }

    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = self.inner.lock();
        inner.state = snapshot.state;
        inner.failures = snapshot.failures;
        inner.last_failure_ts = snapshot.last_failure_ts;
        info!(state = %snapshot.state, failures = snapshot.failures, "circuit breaker state restored");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_max_failures() {
        let cb = CircuitBreaker::new(3, 60.0);
        assert!(cb.allow_request());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new(1, 0.0);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // reset_timeout == 0: any elapsed time is enough for the probe.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(1, 0.0);
        cb.record_failure();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.snapshot().last_failure_ts.is_some());
    }

    #[tokio::test]
    async fn call_fails_fast_when_open() {
        let cb = CircuitBreaker::new(1, 3600.0);
        let r: Result<(), CircuitError<&str>> = cb.call(async { Err("boom") }).await;
        assert!(matches!(r, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.state(), BreakerState::Open);

        let r: Result<(), CircuitError<&str>> = cb.call(async { Ok(()) }).await;
        assert!(matches!(r, Err(CircuitError::Open)));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let cb = CircuitBreaker::new(2, 60.0);
        cb.record_failure();
        cb.record_failure();
        let snap = cb.snapshot();

        let cb2 = CircuitBreaker::new(2, 60.0);
        cb2.restore(&snap);
        assert_eq!(cb2.state(), BreakerState::Open);
        assert!(!cb2.allow_request());
    }
}
