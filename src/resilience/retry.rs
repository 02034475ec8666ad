use std::future::Future;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponentially increasing delay between attempts, capped at 30s. Mirrors
/// the doubling schedule used for container-restart backoff, generalized
/// into a standalone helper any component can reuse.
pub fn backoff_delay(attempt: u32, base_delay: Duration) -> Duration {
    let scaled = base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(MAX_BACKOFF)
}

/// Retry `op` up to `attempts` times with exponentially increasing delay
/// between tries (capped at 30s). Returns the first success or the last
/// error observed. Attempt counters are per-invocation — callers get a
/// fresh budget each call.
pub async fn retry<F, Fut, T, E>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff_delay(attempt, base_delay)).await;
                }
            }
        }
    }
    Err(last_err.expect("attempts.max(1) guarantees at least one iteration"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, base), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error_when_exhausted() {
        let result: Result<(), &str> = retry(3, Duration::from_millis(1), || async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));
    }
}
