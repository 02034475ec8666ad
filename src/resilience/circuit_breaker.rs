use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("circuit breaker open")]
pub struct CircuitOpenError;

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Closed/Open/HalfOpen failure-propagation guard. `failure_threshold`
/// consecutive failures trips Closed→Open; after `timeout` has elapsed
/// since the last failure, the next call transitions Open→HalfOpen;
/// success in HalfOpen returns to Closed, failure returns to Open. Each
/// breaker carries a `name` used only to label the
/// `ingressd_circuit_breaker_trips_total` metric recorded on every
/// Closed/HalfOpen→Open transition.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Call before attempting the guarded operation. Returns
    /// `CircuitOpenError` immediately if the breaker is tripped and the
    /// cool-down has not yet elapsed.
    pub fn before_call(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.timeout {
                    inner.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(CircuitOpenError)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                crate::metrics::record_circuit_breaker_trip(&self.name);
            }
            State::Closed | State::Open => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    let was_already_open = inner.state == State::Open;
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    if !was_already_open {
                        crate::metrics::record_circuit_breaker_trip(&self.name);
                    }
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open)
    }

    /// Run `op` through the breaker: refuses immediately when open,
    /// otherwise calls `op` and records the outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.before_call().map_err(CircuitCallError::Open)?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitCallError::Inner(e))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitCallError<E> {
    #[error("circuit breaker open")]
    Open(CircuitOpenError),
    #[error(transparent)]
    Inner(E),
}
