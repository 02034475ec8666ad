mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// A single container lifecycle event delivered by the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: EventAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Destroy,
    Other,
}

/// What the Watcher needs to know about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Network-reachable address, already resolved per the non-bridge
    /// preference / deterministic tie-break in §9.
    pub address: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("transient runtime error: {0}")]
    Transient(String),
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Capability the rest of the system needs from a container engine. A
/// production implementation talks to a local Docker socket; tests use a
/// programmable fake.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Enumerate all currently running containers.
    async fn enumerate(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// Inspect a single container by id.
    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, RuntimeError>;

    /// Open a long-lived subscription to container lifecycle events. Each
    /// item is already filtered to {start, stop, die, destroy}; other
    /// docker event types are not delivered on this stream. A stream error
    /// ends the subscription; callers are expected to resubscribe.
    async fn subscribe_events(
        &self,
    ) -> Result<
        std::pin::Pin<Box<dyn futures::Stream<Item = Result<ContainerEvent, RuntimeError>> + Send>>,
        RuntimeError,
    >;

    /// Fetch the raw bytes of a single file at `path` inside the
    /// container's filesystem.
    async fn copy_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn is_available(&self) -> bool;
}

/// A no-op client used when no container runtime is reachable at startup.
/// The Watcher keeps running against it (the set simply never becomes
/// non-empty) rather than failing the whole process.
pub struct NoopRuntime;

#[async_trait]
impl RuntimeClient for NoopRuntime {
    async fn enumerate(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        Err(RuntimeError::NotFound(container_id.to_string()))
    }

    async fn subscribe_events(
        &self,
    ) -> Result<
        std::pin::Pin<Box<dyn futures::Stream<Item = Result<ContainerEvent, RuntimeError>> + Send>>,
        RuntimeError,
    > {
        Err(RuntimeError::Fatal("no container runtime available".into()))
    }

    async fn copy_file(&self, _container_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        Err(RuntimeError::NotFound(path.to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }
}
