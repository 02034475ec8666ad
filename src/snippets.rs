use crate::resilience::{CircuitBreaker, CircuitCallError};
use crate::runtime::{RuntimeClient, RuntimeError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const ALLOWED_SUFFIXES: &[&str] = &[".conf", ".txt", ".params"];
const RESERVED_ROOTS: &[&str] = &["/etc", "/var", "/proc", "/sys", "/root"];
const FETCH_FAILURE_THRESHOLD: u32 = 5;
const FETCH_BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnippetError {
    #[error("invalid snippet path: {0}")]
    InvalidValue(String),
    #[error("runtime error fetching snippet: {0}")]
    Runtime(String),
    #[error("snippet fetch circuit open, runtime looks unreachable")]
    ResourceExhausted,
}

impl From<RuntimeError> for SnippetError {
    fn from(e: RuntimeError) -> Self {
        SnippetError::Runtime(e.to_string())
    }
}

/// Rejects traversal, reserved-root, and non-allowlisted paths before any
/// fetch is attempted. Pure and side-effect free so it can run ahead of any
/// runtime call.
pub fn check_path_safety(path: &str) -> Result<(), SnippetError> {
    if path.contains("..") {
        return Err(SnippetError::InvalidValue(format!("path traversal in {path}")));
    }
    if RESERVED_ROOTS.iter().any(|root| path.starts_with(root)) {
        return Err(SnippetError::InvalidValue(format!("reserved directory in {path}")));
    }
    if !ALLOWED_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
        return Err(SnippetError::InvalidValue(format!("disallowed suffix in {path}")));
    }
    Ok(())
}

/// Fetches and caches auxiliary configuration fragments and FastCGI
/// parameter files from inside containers. Runtime fetches (cache misses)
/// run through a circuit breaker: a runtime that is repeatedly
/// unreachable trips the breaker so subsequent loads fail fast instead of
/// each retrying a dead connection.
pub struct SnippetLoader {
    runtime: Arc<dyn RuntimeClient>,
    cache_dir: PathBuf,
    breaker: CircuitBreaker,
}

impl SnippetLoader {
    pub fn new(runtime: Arc<dyn RuntimeClient>, cache_dir: PathBuf) -> Self {
        Self {
            runtime,
            cache_dir,
            breaker: CircuitBreaker::new("snippet_loader", FETCH_FAILURE_THRESHOLD, FETCH_BREAKER_TIMEOUT),
        }
    }

    fn cache_key(container_id: &str, path: &str) -> String {
        let prefix: String = container_id.chars().take(12).collect();
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{prefix}_{digest}")
    }

    fn cache_path(&self, container_id: &str, path: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_key(container_id, path))
    }

    /// Fetch the textual content of `path` inside `container_id`, serving
    /// from the on-disk cache when present.
    pub async fn load(&self, container_id: &str, path: &str) -> Result<String, SnippetError> {
        check_path_safety(path)?;

        let cache_path = self.cache_path(container_id, path);
        if let Ok(cached) = tokio::fs::read(&cache_path).await {
            return Ok(String::from_utf8_lossy(&cached).into_owned());
        }

        let bytes = self
            .breaker
            .call(|| self.runtime.copy_file(container_id, path))
            .await
            .map_err(|e| match e {
                CircuitCallError::Open(_) => SnippetError::ResourceExhausted,
                CircuitCallError::Inner(inner) => SnippetError::from(inner),
            })?;

        if let Some(parent) = cache_path.parent() {
            let _ = create_dir_with_mode(parent).await;
        }
        write_cache_file(&cache_path, &bytes).await;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(unix)]
async fn create_dir_with_mode(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(dir).await?;
    let perms = std::fs::Permissions::from_mode(0o755);
    tokio::fs::set_permissions(dir, perms).await
}

#[cfg(not(unix))]
async fn create_dir_with_mode(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(unix)]
async fn write_cache_file(path: &Path, bytes: &[u8]) {
    use std::os::unix::fs::PermissionsExt;
    if tokio::fs::write(path, bytes).await.is_ok() {
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await;
    }
}

#[cfg(not(unix))]
async fn write_cache_file(path: &Path, bytes: &[u8]) {
    let _ = tokio::fs::write(path, bytes).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    #[test]
    fn rejects_traversal() {
        assert!(check_path_safety("../etc/passwd").is_err());
    }

    #[test]
    fn rejects_reserved_roots() {
        assert!(check_path_safety("/etc/passwd").is_err());
        assert!(check_path_safety("/var/log/app.conf").is_err());
    }

    #[test]
    fn rejects_disallowed_suffix() {
        assert!(check_path_safety("/app/config.yaml").is_err());
    }

    #[test]
    fn accepts_allowlisted_suffix() {
        assert!(check_path_safety("/app/extra.conf").is_ok());
    }

    #[tokio::test]
    async fn traversal_path_never_issues_runtime_call() {
        let runtime = FakeRuntime::new();
        let dir = tempfile::tempdir().unwrap();
        let loader = SnippetLoader::new(runtime.clone(), dir.path().to_path_buf());

        let result = loader.load("c1", "/etc/../etc/passwd").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fetch_then_cache_hit() {
        let runtime = FakeRuntime::new();
        runtime.put_file("c1", "/app/extra.conf", b"location /x { }\n");
        let dir = tempfile::tempdir().unwrap();
        let loader = SnippetLoader::new(runtime.clone(), dir.path().to_path_buf());

        let first = loader.load("c1", "/app/extra.conf").await.unwrap();
        assert_eq!(first, "location /x { }\n");

        runtime.remove_file("c1", "/app/extra.conf");
        let second = loader.load("c1", "/app/extra.conf").await.unwrap();
        assert_eq!(second, "location /x { }\n");
    }

    #[tokio::test]
    async fn repeated_runtime_failures_trip_the_breaker() {
        let runtime = FakeRuntime::new();
        let dir = tempfile::tempdir().unwrap();
        let loader = SnippetLoader::new(runtime.clone(), dir.path().to_path_buf());

        // No file ever seeded, so every distinct path is a genuine cache
        // miss that fails at the runtime, tripping the breaker after
        // FETCH_FAILURE_THRESHOLD consecutive misses.
        for n in 0..FETCH_FAILURE_THRESHOLD {
            let path = format!("/app/miss-{n}.conf");
            let err = loader.load("c1", &path).await.unwrap_err();
            assert!(matches!(err, SnippetError::Runtime(_)));
        }

        let err = loader.load("c1", "/app/miss-last.conf").await.unwrap_err();
        assert_eq!(err, SnippetError::ResourceExhausted);
    }
}
