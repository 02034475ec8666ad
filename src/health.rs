use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::resilience::panic_guard;
use crate::resilience::RollingErrorCounter;

/// A component is considered Unhealthy once its rolling error count
/// reaches this many failures, Degraded once it reaches half that.
const ERROR_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Healthy,
    Degraded,
    Unhealthy,
}

type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type ProbeFn = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

struct Component {
    state: Mutex<ComponentState>,
    errors: RollingErrorCounter,
    last_check: Mutex<Option<DateTime<Utc>>>,
    probe: ProbeFn,
    interval: Duration,
}

#[derive(Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub status: ComponentState,
    pub error_count: u32,
    pub last_check: Option<DateTime<Utc>>,
}

/// In-process registry of named components, each with a periodic probe.
/// Overall state is the worst of any registered component.
#[derive(Default)]
pub struct HealthSurface {
    components: Mutex<HashMap<String, Arc<Component>>>,
}

impl HealthSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, interval: Duration, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let name = name.into();
        let probe: ProbeFn = Arc::new(move || Box::pin(probe()));
        self.components.lock().insert(
            name,
            Arc::new(Component {
                state: Mutex::new(ComponentState::Healthy),
                errors: RollingErrorCounter::new(ERROR_THRESHOLD),
                last_check: Mutex::new(None),
                probe,
                interval,
            }),
        );
    }

    /// A success clears the rolling count immediately; a failure
    /// accumulates in the five-minute window and the state reflects
    /// where the count sits relative to `ERROR_THRESHOLD` at the moment
    /// of the check, so a component that stops being probed (or keeps
    /// failing without ever succeeding) decays back to Healthy once the
    /// window rolls over rather than staying Degraded/Unhealthy forever.
    fn record(component: &Component, success: bool) {
        *component.last_check.lock() = Some(Utc::now());
        if success {
            component.errors.reset();
            *component.state.lock() = ComponentState::Healthy;
            return;
        }

        component.errors.record_error();
        let state = if component.errors.count() >= ERROR_THRESHOLD {
            ComponentState::Unhealthy
        } else if component.errors.is_degraded() {
            ComponentState::Degraded
        } else {
            ComponentState::Healthy
        };
        *component.state.lock() = state;
    }

    /// Spawn one panic-guarded probe task per registered component.
    pub fn spawn_probes(self: &Arc<Self>, cancel: CancellationToken) {
        let components = self.components.lock().clone();
        for (name, component) in components {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(component.interval) => {}
                    }

                    let component_for_probe = component.clone();
                    let result = panic_guard::guarded(&name, async move { (component_for_probe.probe)().await }).await;
                    let success = result.unwrap_or(false);
                    Self::record(&component, success);
                }
            });
        }
    }

    pub fn overall(&self) -> ComponentState {
        self.components
            .lock()
            .values()
            .map(|c| *c.state.lock())
            .max_by_key(|s| match s {
                ComponentState::Healthy => 0,
                ComponentState::Degraded => 1,
                ComponentState::Unhealthy => 2,
            })
            .unwrap_or(ComponentState::Healthy)
    }

    pub fn detailed(&self) -> Vec<ComponentStatus> {
        self.components
            .lock()
            .iter()
            .map(|(name, c)| ComponentStatus {
                name: name.clone(),
                status: *c.state.lock(),
                error_count: c.errors.count(),
                last_check: *c.last_check.lock(),
            })
            .collect()
    }

    pub fn router(self: Arc<Self>, metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/detailed", get(health_detailed_handler))
            .with_state(self);

        if let Some(handle) = metrics_handle {
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router.layer(TraceLayer::new_for_http())
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health_handler(State(surface): State<Arc<HealthSurface>>) -> impl IntoResponse {
    match surface.overall() {
        ComponentState::Healthy => (StatusCode::OK, Json(HealthBody { status: "healthy" })),
        ComponentState::Degraded => (StatusCode::OK, Json(HealthBody { status: "degraded" })),
        ComponentState::Unhealthy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody { status: "unhealthy" }),
        ),
    }
}

async fn health_detailed_handler(State(surface): State<Arc<HealthSurface>>) -> impl IntoResponse {
    Json(surface.detailed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    #[test]
    fn overall_is_worst_of_any_component() {
        let surface = HealthSurface::default();
        surface.components.lock().insert(
            "a".to_string(),
            Arc::new(Component {
                state: Mutex::new(ComponentState::Healthy),
                errors: RollingErrorCounter::new(ERROR_THRESHOLD),
                last_check: Mutex::new(None),
                probe: Arc::new(|| Box::pin(async { true })),
                interval: Duration::from_secs(1),
            }),
        );
        let unhealthy = Arc::new(Component {
            state: Mutex::new(ComponentState::Unhealthy),
            errors: RollingErrorCounter::new(ERROR_THRESHOLD),
            last_check: Mutex::new(None),
            probe: Arc::new(|| Box::pin(async { true })),
            interval: Duration::from_secs(1),
        });
        for _ in 0..ERROR_THRESHOLD {
            unhealthy.errors.record_error();
        }
        surface.components.lock().insert("b".to_string(), unhealthy);
        assert_eq!(surface.overall(), ComponentState::Unhealthy);
    }

    #[test]
    fn record_transitions_through_thresholds() {
        let component = Component {
            state: Mutex::new(ComponentState::Healthy),
            errors: RollingErrorCounter::new(ERROR_THRESHOLD),
            last_check: Mutex::new(None),
            probe: Arc::new(|| Box::pin(async { true })),
            interval: Duration::from_secs(1),
        };

        HealthSurface::record(&component, false);
        assert_eq!(*component.state.lock(), ComponentState::Healthy);
        HealthSurface::record(&component, false);
        assert_eq!(*component.state.lock(), ComponentState::Degraded);
        for _ in 0..3 {
            HealthSurface::record(&component, false);
        }
        assert_eq!(*component.state.lock(), ComponentState::Unhealthy);
        HealthSurface::record(&component, true);
        assert_eq!(*component.state.lock(), ComponentState::Healthy);
    }

    #[tokio::test]
    async fn registered_probe_updates_state() {
        let surface = HealthSurface::new();
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        surface.register("probe", Duration::from_millis(10), move || {
            let flag = flag.clone();
            async move { flag.load(Ordering::SeqCst) }
        });

        let cancel = CancellationToken::new();
        surface.spawn_probes(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_ne!(surface.overall(), ComponentState::Healthy);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert_eq!(surface.overall(), ComponentState::Healthy);
    }
}
