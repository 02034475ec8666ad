use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("reload requested while not running")]
    NotRunning,
    #[error("configuration test failed: {0}")]
    ConfigTestFailed(String),
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("signal delivery failed: {0}")]
    SignalFailed(String),
}

/// A child exited while the supervisor was not the one requesting
/// shutdown — reported to whoever is driving the reconcile loop so it can
/// decide whether to restart.
#[derive(Debug, Clone)]
pub struct UnexpectedExit {
    pub code: Option<i32>,
}

struct Inner {
    state: SupervisorState,
    child: Option<Child>,
}

/// Owns the lifecycle of the supervised nginx child process. Start,
/// Reload, and Stop are serialized through the same lock covering the
/// child handle, so Reload is never observed concurrently with the
/// monitor task reporting an exit.
pub struct ProcessSupervisor {
    binary: String,
    config_path: PathBuf,
    inner: Mutex<Inner>,
    exit_tx: mpsc::UnboundedSender<UnexpectedExit>,
}

impl ProcessSupervisor {
    pub fn new(binary: impl Into<String>, config_path: PathBuf) -> (Arc<Self>, mpsc::UnboundedReceiver<UnexpectedExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            binary: binary.into(),
            config_path,
            inner: Mutex::new(Inner {
                state: SupervisorState::Stopped,
                child: None,
            }),
            exit_tx,
        });
        (supervisor, exit_rx)
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    /// Run the target binary's configuration-test mode out of process.
    pub async fn run_configtest(&self) -> Result<(), SupervisorError> {
        let output = Command::new(&self.binary)
            .arg("-t")
            .arg("-c")
            .arg(&self.config_path)
            .output()
            .await
            .map_err(SupervisorError::SpawnFailed)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SupervisorError::ConfigTestFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    /// Start the child in foreground mode, in its own process group, with
    /// stdout/stderr inherited.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SupervisorState::Running {
            return Ok(());
        }
        inner.state = SupervisorState::Starting;

        let mut command = Command::new(&self.binary);
        command
            .arg("-c")
            .arg(&self.config_path)
            .arg("-g")
            .arg("daemon off;")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        unsafe_process_group(&mut command);

        let child = command.spawn().map_err(SupervisorError::SpawnFailed)?;
        inner.child = Some(child);
        inner.state = SupervisorState::Running;
        drop(inner);

        self.spawn_monitor();
        info!(binary = %self.binary, "nginx child started");
        Ok(())
    }

    /// Reload is only accepted in Running. Refuses if the pre-reload
    /// configuration test fails.
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        {
            let inner = self.inner.lock().await;
            if inner.state != SupervisorState::Running {
                return Err(SupervisorError::NotRunning);
            }
        }

        self.run_configtest().await?;

        let inner = self.inner.lock().await;
        let pid = inner
            .child
            .as_ref()
            .and_then(|c| c.id())
            .ok_or(SupervisorError::NotRunning)?;
        send_signal(pid, Signal::Sighup)?;
        info!(pid, "nginx child reloaded");
        Ok(())
    }

    /// Send the graceful-shutdown signal, wait up to 10s, force-kill on
    /// timeout. Always leaves the supervisor in `Stopped`.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            inner.state = SupervisorState::Stopped;
            return Ok(());
        };
        inner.state = SupervisorState::Stopping;

        if let Some(pid) = child.id() {
            let _ = send_signal(pid, Signal::Sigquit);
        }

        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("graceful stop timed out, killing child");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        inner.state = SupervisorState::Stopped;
        Ok(())
    }

    /// Poll the child's exit status periodically rather than awaiting
    /// `wait()` directly, so the lock is only ever held briefly and Reload
    /// / Stop can always get in to send a signal.
    fn spawn_monitor(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;

                let mut inner = supervisor.inner.lock().await;
                let Some(child) = inner.child.as_mut() else {
                    return;
                };

                match child.try_wait() {
                    Ok(Some(status)) => {
                        let was_stopping = inner.state == SupervisorState::Stopping;
                        inner.child = None;
                        inner.state = SupervisorState::Stopped;
                        drop(inner);

                        if !was_stopping {
                            error!(code = ?status.code(), "nginx child exited unexpectedly");
                            let _ = supervisor.exit_tx.send(UnexpectedExit { code: status.code() });
                        }
                        return;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, "error polling child status");
                        continue;
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Sighup,
    Sigquit,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Sighup => NixSignal::SIGHUP,
        Signal::Sigquit => NixSignal::SIGQUIT,
    };
    kill(Pid::from_raw(pid as i32), nix_signal).map_err(|e| SupervisorError::SignalFailed(e.to_string()))
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> Result<(), SupervisorError> {
    Err(SupervisorError::SignalFailed("signals unsupported on this platform".into()))
}

#[cfg(unix)]
fn unsafe_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn unsafe_process_group(_command: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_refused_when_not_running() {
        let (supervisor, _rx) = ProcessSupervisor::new("true", PathBuf::from("/dev/null"));
        let err = supervisor.reload().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning));
    }

    #[tokio::test]
    async fn stop_on_never_started_supervisor_is_a_no_op() {
        let (supervisor, _rx) = ProcessSupervisor::new("true", PathBuf::from("/dev/null"));
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state().await, SupervisorState::Stopped);
    }
}
