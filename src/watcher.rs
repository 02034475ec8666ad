use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::ContainerRecord;
use crate::resilience::{retry, ClassifiedError};
use crate::runtime::{EventAction, RuntimeClient};

const SUBSCRIBE_COOLDOWN: Duration = Duration::from_secs(2);
const SUBSCRIBE_RETRY_ATTEMPTS: u32 = 5;
const SUBSCRIBE_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Maintains an eventually-consistent view of containers carrying at least
/// one label under the reserved prefix. Exclusively owns the container
/// set; every other component reads a snapshot copied under the read
/// lock.
pub struct Watcher {
    runtime: Arc<dyn RuntimeClient>,
    prefix: String,
    containers: RwLock<HashMap<String, ContainerRecord>>,
    dirty_tx: watch::Sender<()>,
}

impl Watcher {
    pub fn new(runtime: Arc<dyn RuntimeClient>, prefix: impl Into<String>) -> (Arc<Self>, watch::Receiver<()>) {
        let (dirty_tx, dirty_rx) = watch::channel(());
        let watcher = Arc::new(Self {
            runtime,
            prefix: prefix.into(),
            containers: RwLock::new(HashMap::new()),
            dirty_tx,
        });
        (watcher, dirty_rx)
    }

    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.containers.read().values().cloned().collect()
    }

    /// Enumerate all currently running containers and keep those whose
    /// labels contain at least one key under the reserved prefix.
    pub async fn bootstrap(&self) -> Result<(), ClassifiedError> {
        let snapshots = self
            .runtime
            .enumerate()
            .await
            .map_err(|e| ClassifiedError::error("watcher", format!("bootstrap enumerate failed: {e}")))?;

        let mut containers = self.containers.write();
        containers.clear();
        for snapshot in snapshots {
            let record = to_record(snapshot);
            if record.running && record.matches_prefix(&self.prefix) {
                containers.insert(record.id.clone(), record);
            }
        }
        drop(containers);
        self.mark_dirty();
        Ok(())
    }

    fn mark_dirty(&self) {
        let _ = self.dirty_tx.send(());
    }

    async fn handle_start(&self, container_id: &str) {
        match self.runtime.inspect(container_id).await {
            Ok(snapshot) => {
                let record = to_record(snapshot);
                if record.running && record.matches_prefix(&self.prefix) {
                    self.containers.write().insert(record.id.clone(), record);
                    self.mark_dirty();
                } else {
                    let removed = self.containers.write().remove(container_id);
                    if removed.is_some() {
                        self.mark_dirty();
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(container_id, "container vanished before inspect completed");
            }
            Err(e) => {
                warn!(container_id, error = %e, "transient inspect failure, dropping event");
            }
        }
    }

    fn handle_removal(&self, container_id: &str) {
        if self.containers.write().remove(container_id).is_some() {
            self.mark_dirty();
        }
    }

    async fn handle_event(&self, event: crate::runtime::ContainerEvent) {
        match event.action {
            EventAction::Start => self.handle_start(&event.container_id).await,
            EventAction::Stop | EventAction::Die | EventAction::Destroy => {
                self.handle_removal(&event.container_id)
            }
            EventAction::Other => {}
        }
    }

    /// Drives the subscribe/process/resubscribe loop until cancelled or
    /// subscription retries are exhausted (a `Critical` event, logged, but
    /// not fatal to the rest of the process — the last good config keeps
    /// serving).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let runtime = self.runtime.clone();
            let subscribe_result = retry::retry(SUBSCRIBE_RETRY_ATTEMPTS, SUBSCRIBE_RETRY_BASE_DELAY, move || {
                let runtime = runtime.clone();
                async move { runtime.subscribe_events().await }
            })
            .await;

            let mut stream = match subscribe_result {
                Ok(stream) => stream,
                Err(e) => {
                    ClassifiedError::critical(
                        "watcher",
                        format!("event subscription retries exhausted: {e}"),
                    )
                    .log();
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => self.handle_event(event).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream error, will resubscribe after cooldown");
                                break;
                            }
                            None => {
                                warn!("event stream ended, will resubscribe after cooldown");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SUBSCRIBE_COOLDOWN) => {}
            }
        }
    }
}

fn to_record(snapshot: crate::runtime::ContainerSnapshot) -> ContainerRecord {
    ContainerRecord {
        id: snapshot.id,
        name: snapshot.name,
        running: snapshot.running,
        address: snapshot.address,
        network: snapshot.network,
        labels: snapshot.labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::{ContainerEvent, ContainerSnapshot, RuntimeError};
    use std::time::Duration;

    fn snapshot(id: &str, running: bool, labels: &[(&str, &str)]) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.to_string(),
            name: format!("name-{id}"),
            running,
            address: Some("10.0.0.5".to_string()),
            network: Some("app_net".to_string()),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn bootstrap_keeps_only_running_labeled_containers() {
        let runtime = FakeRuntime::new();
        runtime.seed(snapshot("c1", true, &[("nginx.ingress.host", "a")]));
        runtime.seed(snapshot("c2", true, &[("other.label", "x")]));

        let (watcher, _rx) = Watcher::new(runtime, "nginx.ingress");
        watcher.bootstrap().await.unwrap();

        let set = watcher.snapshot();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].id, "c1");
    }

    #[tokio::test]
    async fn start_event_with_transient_then_success_ends_in_set() {
        let runtime = FakeRuntime::new();
        runtime.seed(snapshot("c1", true, &[("nginx.ingress.host", "a")]));
        runtime.queue_inspect_failure(RuntimeError::Transient("flaky".into()));

        let (watcher, mut dirty_rx) = Watcher::new(runtime.clone(), "nginx.ingress");
        watcher.handle_start("c1").await;
        assert!(watcher.snapshot().is_empty());

        watcher.handle_start("c1").await;
        assert_eq!(watcher.snapshot().len(), 1);
        assert!(dirty_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn stop_event_removes_tracked_container() {
        let runtime = FakeRuntime::new();
        runtime.seed(snapshot("c1", true, &[("nginx.ingress.host", "a")]));

        let (watcher, _rx) = Watcher::new(runtime, "nginx.ingress");
        watcher.bootstrap().await.unwrap();
        assert_eq!(watcher.snapshot().len(), 1);

        watcher
            .handle_event(ContainerEvent {
                container_id: "c1".to_string(),
                action: EventAction::Stop,
            })
            .await;
        assert!(watcher.snapshot().is_empty());
    }

    #[tokio::test]
    async fn not_found_inspect_is_silently_dropped() {
        let runtime = FakeRuntime::new();
        let (watcher, _rx) = Watcher::new(runtime, "nginx.ingress");
        watcher.handle_start("missing").await;
        assert!(watcher.snapshot().is_empty());
    }

    #[tokio::test]
    async fn set_matches_fresh_enumeration_after_event_sequence() {
        let runtime = FakeRuntime::new();
        runtime.seed(snapshot("c1", true, &[("nginx.ingress.host", "a")]));
        runtime.seed(snapshot("c2", true, &[("nginx.ingress.host", "b")]));

        let (watcher, _rx) = Watcher::new(runtime.clone(), "nginx.ingress");
        watcher.bootstrap().await.unwrap();

        runtime.remove("c2");
        watcher
            .handle_event(ContainerEvent {
                container_id: "c2".to_string(),
                action: EventAction::Destroy,
            })
            .await;

        let fresh = runtime.enumerate().await.unwrap();
        let fresh_ids: std::collections::HashSet<_> = fresh.into_iter().map(|s| s.id).collect();
        let tracked_ids: std::collections::HashSet<_> = watcher.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(fresh_ids, tracked_ids);
    }

    #[tokio::test]
    async fn resubscribes_after_stream_error_and_keeps_processing() {
        let runtime = FakeRuntime::new();
        runtime.seed(snapshot("c1", true, &[("nginx.ingress.host", "a")]));
        let (watcher, _rx) = Watcher::new(runtime.clone(), "nginx.ingress");
        watcher.bootstrap().await.unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(Watcher::run(watcher.clone(), run_cancel));

        runtime.emit_stream_error(RuntimeError::Transient("drop".into())).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
