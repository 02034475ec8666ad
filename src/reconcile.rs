use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fastcgi;
use crate::labels::{self, RouteConfig};
use crate::render::{LoadedExtras, RenderedModel, Renderer};
use crate::resilience::{retry, ClassifiedError};
use crate::snippets::SnippetLoader;
use crate::supervisor::ProcessSupervisor;
use crate::watcher::Watcher;

const DEGRADED_BACKOFF: Duration = Duration::from_secs(30);
const FAILURE_THRESHOLD: u32 = 3;
const RENDER_RETRY_ATTEMPTS: u32 = 3;
const RENDER_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Rendering,
    Committing,
    Reloading,
    DegradedBackoff,
}

pub struct ReconcilerConfig {
    pub label_prefix: String,
    pub config_path: PathBuf,
}

/// Orchestrates snapshot → render → validate → commit → reload, collapsing
/// duplicate triggers to at most one in-flight pass.
pub struct Reconciler {
    config: ReconcilerConfig,
    watcher: Arc<Watcher>,
    snippet_loader: SnippetLoader,
    renderer: Renderer,
    supervisor: Arc<ProcessSupervisor>,
    state: Mutex<ReconcilerState>,
    last_committed_text: Mutex<Option<String>>,
    consecutive_failures: AtomicU32,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        watcher: Arc<Watcher>,
        snippet_loader: SnippetLoader,
        renderer: Renderer,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            watcher,
            snippet_loader,
            renderer,
            supervisor,
            state: Mutex::new(ReconcilerState::Idle),
            last_committed_text: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ReconcilerState) {
        *self.state.lock() = state;
    }

    /// Derive valid, enabled `RouteConfig`s from the current container
    /// snapshot. Invalid containers are logged as warnings and skipped;
    /// one bad container never poisons the batch.
    fn derive_routes(&self) -> Vec<RouteConfig> {
        let snapshot = self.watcher.snapshot();
        let mut routes = Vec::with_capacity(snapshot.len());
        for record in snapshot {
            match labels::parse(
                &record.id,
                &record.name,
                record.address.as_deref(),
                &record.labels,
                &self.config.label_prefix,
            ) {
                Ok(route) => routes.push(route),
                Err(e) => warn!(container_id = %record.id, error = %e, "skipping container with invalid labels"),
            }
        }
        routes
    }

    async fn load_extras(&self, routes: &[RouteConfig]) -> HashMap<String, LoadedExtras> {
        let mut extras = HashMap::new();
        for route in routes.iter().filter(|r| r.enabled) {
            let mut loaded = LoadedExtras::default();

            if let Some(path) = &route.configuration_snippet {
                match self.snippet_loader.load(&route.container_id, path).await {
                    Ok(content) => loaded.configuration_snippet = Some(content),
                    Err(e) => warn!(container_id = %route.container_id, error = %e, "skipping configuration snippet"),
                }
            }
            if let Some(path) = &route.server_snippet {
                match self.snippet_loader.load(&route.container_id, path).await {
                    Ok(content) => loaded.server_snippet = Some(content),
                    Err(e) => warn!(container_id = %route.container_id, error = %e, "skipping server snippet"),
                }
            }

            if route.fastcgi.enabled {
                let file_params = match &route.fastcgi.params_file {
                    Some(path) => match self.snippet_loader.load(&route.container_id, path).await {
                        Ok(content) => fastcgi::parse_params_file(&content),
                        Err(e) => {
                            warn!(container_id = %route.container_id, error = %e, "skipping fastcgi params file");
                            HashMap::new()
                        }
                    },
                    None => HashMap::new(),
                };

                match fastcgi::merge(&route.fastcgi.params, &file_params) {
                    Ok(merged) => loaded.fastcgi_params = Some(merged),
                    Err(e) => warn!(container_id = %route.container_id, error = %e, "fastcgi route fails validation"),
                }
            }

            extras.insert(route.container_id.clone(), loaded);
        }
        extras
    }

    /// Run one reconcile pass. Returns `Ok(true)` if a new config was
    /// committed and a reload was requested, `Ok(false)` if the pass was a
    /// no-op (unchanged render), and `Err` on a failure the caller should
    /// count toward the degraded-backoff threshold.
    pub async fn reconcile_once(&self) -> Result<bool, ClassifiedError> {
        self.set_state(ReconcilerState::Rendering);

        let routes = self.derive_routes();
        let extras = self.load_extras(&routes).await;

        let fastcgi_ok: Vec<RouteConfig> = routes
            .into_iter()
            .filter(|r| {
                !r.fastcgi.enabled || extras.get(&r.container_id).map(|e| e.fastcgi_params.is_some()).unwrap_or(false)
            })
            .collect();

        let model = Renderer::build_model(&fastcgi_ok, &extras);
        let text = self
            .renderer
            .render(&model, Utc::now())
            .map_err(|e| ClassifiedError::error("renderer", e.to_string()))?;

        if self.last_committed_text.lock().as_deref() == Some(text.as_str()) {
            self.set_state(ReconcilerState::Idle);
            return Ok(false);
        }

        self.set_state(ReconcilerState::Committing);
        self.commit_and_validate(&text).await?;

        self.set_state(ReconcilerState::Reloading);
        self.reload_or_start().await?;

        *self.last_committed_text.lock() = Some(text);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_state(ReconcilerState::Idle);
        Ok(true)
    }

    /// Writes the candidate under a distinct temp name and validates it
    /// out-of-process *before* the atomic rename, so an unvalidated
    /// candidate never becomes the live config.
    async fn commit_and_validate(&self, text: &str) -> Result<(), ClassifiedError> {
        let candidate_path = self.config.config_path.with_extension("candidate");

        retry::retry(RENDER_RETRY_ATTEMPTS, RENDER_RETRY_BASE_DELAY, || async {
            tokio::fs::write(&candidate_path, text).await
        })
        .await
        .map_err(|e| ClassifiedError::error("reconciler", format!("failed writing candidate config: {e}")))?;

        if let Err(e) = self.supervisor.run_configtest().await {
            let _ = tokio::fs::remove_file(&candidate_path).await;
            return Err(ClassifiedError::warning("reconciler", format!("configtest failed: {e}")));
        }

        tokio::fs::rename(&candidate_path, &self.config.config_path)
            .await
            .map_err(|e| ClassifiedError::error("reconciler", format!("atomic rename failed: {e}")))?;

        Ok(())
    }

    async fn reload_or_start(&self) -> Result<(), ClassifiedError> {
        use crate::supervisor::SupervisorError;

        match self.supervisor.reload().await {
            Ok(()) => Ok(()),
            Err(SupervisorError::NotRunning) => {
                crate::metrics::record_supervisor_restart("not_running");
                self.supervisor
                    .start()
                    .await
                    .map_err(|e| ClassifiedError::error("supervisor", e.to_string()))
            }
            Err(e) => Err(ClassifiedError::error("supervisor", e.to_string())),
        }
    }

    async fn record_outcome(&self, result: &Result<bool, ClassifiedError>) {
        match result {
            Ok(true) => crate::metrics::record_reconcile_pass("committed"),
            Ok(false) => crate::metrics::record_reconcile_pass("noop"),
            Err(e) => {
                crate::metrics::record_reconcile_pass("failed");
                e.log();
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= FAILURE_THRESHOLD {
                    self.set_state(ReconcilerState::DegradedBackoff);
                    warn!("entering degraded backoff after {failures} consecutive failures");
                    tokio::time::sleep(DEGRADED_BACKOFF).await;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.set_state(ReconcilerState::Idle);
                }
            }
        }
    }

    /// Drives the reconcile loop: waits for a dirty tick, runs a pass,
    /// and immediately starts another pass if a tick arrived meanwhile.
    pub async fn run(self: Arc<Self>, mut dirty_rx: watch::Receiver<()>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = dirty_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            loop {
                dirty_rx.borrow_and_update();
                let result = self.reconcile_once().await;
                if let Ok(true) = result {
                    info!("reconcile pass committed a new configuration");
                }
                self.record_outcome(&result).await;

                if !dirty_rx.has_changed().unwrap_or(false) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ContainerSnapshot;

    fn make_reconciler(runtime: Arc<FakeRuntime>) -> (Arc<Reconciler>, Arc<Watcher>, tokio::sync::watch::Receiver<()>) {
        let (watcher, dirty_rx) = Watcher::new(runtime, "nginx.ingress");
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ingressd.conf");
        // Leak the tempdir so the path stays valid for the test's lifetime.
        std::mem::forget(dir);

        let snippet_loader = SnippetLoader::new(watcher_runtime_handle(&watcher), std::env::temp_dir());
        let renderer = Renderer::load(None).unwrap();
        let (supervisor, _rx) = ProcessSupervisor::new("true", config_path.clone());

        let reconciler = Arc::new(Reconciler::new(
            ReconcilerConfig {
                label_prefix: "nginx.ingress".to_string(),
                config_path,
            },
            watcher.clone(),
            snippet_loader,
            renderer,
            supervisor,
        ));
        (reconciler, watcher, dirty_rx)
    }

    fn watcher_runtime_handle(_watcher: &Arc<Watcher>) -> Arc<dyn crate::runtime::RuntimeClient> {
        FakeRuntime::new()
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_a_no_op_second_pass() {
        let runtime = FakeRuntime::new();
        runtime.seed(ContainerSnapshot {
            id: "c1".to_string(),
            name: "app".to_string(),
            running: true,
            address: Some("10.0.0.5".to_string()),
            network: Some("app_net".to_string()),
            labels: [
                ("nginx.ingress.enable".to_string(), "true".to_string()),
                ("nginx.ingress.host".to_string(), "app.local".to_string()),
            ]
            .into_iter()
            .collect(),
        });

        let (reconciler, watcher, _rx) = make_reconciler(runtime);
        watcher.bootstrap().await.unwrap();

        // true (nginx is stubbed by the `true` binary, always succeeds).
        let first = reconciler.reconcile_once().await;
        assert!(first.is_ok());

        let second = reconciler.reconcile_once().await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn invalid_container_is_skipped_others_still_render() {
        let runtime = FakeRuntime::new();
        runtime.seed(ContainerSnapshot {
            id: "bad".to_string(),
            name: "bad".to_string(),
            running: true,
            address: Some("10.0.0.1".to_string()),
            network: None,
            labels: [
                ("nginx.ingress.enable".to_string(), "true".to_string()),
                ("nginx.ingress.host".to_string(), "a".to_string()),
                ("nginx.ingress.port".to_string(), "99999".to_string()),
            ]
            .into_iter()
            .collect(),
        });
        runtime.seed(ContainerSnapshot {
            id: "good".to_string(),
            name: "good".to_string(),
            running: true,
            address: Some("10.0.0.2".to_string()),
            network: None,
            labels: [
                ("nginx.ingress.enable".to_string(), "true".to_string()),
                ("nginx.ingress.host".to_string(), "b".to_string()),
            ]
            .into_iter()
            .collect(),
        });

        let (reconciler, watcher, _rx) = make_reconciler(runtime);
        watcher.bootstrap().await.unwrap();

        let routes = reconciler.derive_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].container_id, "good");
    }
}
