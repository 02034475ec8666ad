pub mod circuit_breaker;
pub mod error;
pub mod panic_guard;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitCallError, CircuitOpenError};
pub use error::{ClassifiedError, Severity};
pub use panic_guard::{guarded, spawn_guarded};
pub use retry::{backoff_delay, retry};

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const ROLLING_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Counts errors in a rolling five-minute window; used by the
/// HealthSurface to report "degraded" once half of a component's error
/// threshold has been crossed within the window.
pub struct RollingErrorCounter {
    threshold: u32,
    inner: Mutex<(u32, Instant)>,
}

impl RollingErrorCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            inner: Mutex::new((0, Instant::now())),
        }
    }

    fn reset_if_expired(inner: &mut (u32, Instant)) {
        if inner.1.elapsed() >= ROLLING_WINDOW {
            inner.0 = 0;
            inner.1 = Instant::now();
        }
    }

    pub fn record_error(&self) {
        let mut inner = self.inner.lock();
        Self::reset_if_expired(&mut inner);
        inner.0 += 1;
    }

    pub fn is_degraded(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::reset_if_expired(&mut inner);
        inner.0 >= self.threshold / 2
    }

    pub fn count(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::reset_if_expired(&mut inner);
        inner.0
    }

    /// Clears the count immediately, independent of the rolling window.
    /// Used when a successful probe/call should forgive prior failures
    /// right away rather than waiting out the window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.0 = 0;
        inner.1 = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_once_half_threshold_crossed() {
        let counter = RollingErrorCounter::new(10);
        for _ in 0..4 {
            counter.record_error();
        }
        assert!(!counter.is_degraded());
        counter.record_error();
        assert!(counter.is_degraded());
    }
}
