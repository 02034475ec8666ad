use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingressd::cert;
use ingressd::config::Config;
use ingressd::health::HealthSurface;
use ingressd::reconcile::{Reconciler, ReconcilerConfig};
use ingressd::render::Renderer;
use ingressd::runtime::{DockerRuntime, NoopRuntime, RuntimeClient};
use ingressd::snippets::SnippetLoader;
use ingressd::supervisor::ProcessSupervisor;
use ingressd::watcher::Watcher;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse_from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ingressd");

    let metrics_handle = init_metrics();
    ingressd::metrics::describe();

    cert::ensure_default_certificate(&config.cert_dir).await?;
    tokio::fs::create_dir_all(&config.snippet_cache_dir).await?;

    let runtime: Arc<dyn RuntimeClient> = match DockerRuntime::new(&config.docker_socket) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "could not connect to container runtime, continuing with an empty set");
            Arc::new(NoopRuntime)
        }
    };

    let (watcher, dirty_rx) = Watcher::new(runtime.clone(), config.label_prefix.clone());
    if let Err(e) = watcher.bootstrap().await {
        e.log();
    }

    let snippet_loader = SnippetLoader::new(runtime.clone(), config.snippet_cache_dir.clone());
    let renderer = Renderer::load(config.template_path.as_deref())?;
    let (supervisor, mut unexpected_exit_rx) = ProcessSupervisor::new(config.nginx_binary.clone(), config.config_path.clone());

    let reconciler = Arc::new(Reconciler::new(
        ReconcilerConfig {
            label_prefix: config.label_prefix.clone(),
            config_path: config.config_path.clone(),
        },
        watcher.clone(),
        snippet_loader,
        renderer,
        supervisor.clone(),
    ));

    let health = HealthSurface::new();
    {
        let reconciler = reconciler.clone();
        health.register("reconciler", Duration::from_secs(10), move || {
            let reconciler = reconciler.clone();
            async move { !matches!(reconciler.state(), ingressd::reconcile::ReconcilerState::DegradedBackoff) }
        });
    }
    {
        let supervisor = supervisor.clone();
        health.register("supervisor", Duration::from_secs(10), move || {
            let supervisor = supervisor.clone();
            async move {
                !matches!(
                    supervisor.state().await,
                    ingressd::supervisor::SupervisorState::Stopped
                )
            }
        });
    }
    {
        let runtime = runtime.clone();
        health.register("runtime", Duration::from_secs(10), move || {
            let runtime = runtime.clone();
            async move { runtime.is_available().await }
        });
    }

    let cancel = CancellationToken::new();

    health.clone().spawn_probes(cancel.clone());

    let watcher_task = ingressd::resilience::spawn_guarded("watcher", Watcher::run(watcher.clone(), cancel.clone()));
    let reconciler_task = ingressd::resilience::spawn_guarded(
        "reconciler",
        Reconciler::run(reconciler.clone(), dirty_rx, cancel.clone()),
    );

    let unexpected_exit_task = {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        ingressd::resilience::spawn_guarded("supervisor-monitor", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    exit = unexpected_exit_rx.recv() => {
                        match exit {
                            Some(e) => {
                                tracing::error!(code = ?e.code, "nginx exited unexpectedly, restarting");
                                ingressd::metrics::record_supervisor_restart("unexpected_exit");
                                if let Err(err) = supervisor.start().await {
                                    tracing::error!(error = %err, "failed to restart nginx after unexpected exit");
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        })
    };

    let health_addr = config.health_addr.clone();
    let router = health.clone().router(Some(metrics_handle));
    let listener = tokio::net::TcpListener::bind(&health_addr).await?;
    tracing::info!(addr = %health_addr, "health surface listening");

    let server_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_cancel.cancel();
        })
        .await?;

    let _ = tokio::join!(watcher_task, reconciler_task, unexpected_exit_task);
    supervisor.stop().await.ok();

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
