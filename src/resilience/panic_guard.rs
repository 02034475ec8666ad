use super::error::ClassifiedError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Wrap a background task body so a panic inside it is caught and
/// reported as a `Critical` `ClassifiedError` instead of silently taking
/// down the task (and, with `panic = "abort"`, the process).
pub async fn guarded<F>(component: &str, fut: F) -> Result<F::Output, ClassifiedError>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let message = panic_message(&payload);
            let err = ClassifiedError::critical(component, format!("panic recovered: {message}"));
            err.log();
            Err(err)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn `fut` on the Tokio runtime under a panic guard, tagging recovered
/// panics with `component`. The returned handle's output is `Ok(value)` on
/// normal completion, `Err` when the task panicked.
pub fn spawn_guarded<F>(component: &'static str, fut: F) -> tokio::task::JoinHandle<Result<F::Output, ClassifiedError>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(guarded(component, fut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recovers_a_panic_as_critical_error() {
        let result = guarded("test-component", async { panic!("boom") }).await;
        let err = result.unwrap_err();
        assert_eq!(err.component, "test-component");
        assert!(err.cause.contains("boom"));
    }

    #[tokio::test]
    async fn passes_through_normal_output() {
        let result = guarded("test-component", async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
