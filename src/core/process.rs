//! Process supervision - spawning, watching and stopping the proxy core

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::platform;

/// Observer invoked once per child lifetime with its exit code
pub type ExitHook = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Lifecycle of the supervised core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// The core executable and the flags every invocation shares
#[derive(Debug, Clone)]
pub struct CoreBinary {
    pub path: PathBuf,
    /// Working directory for geo databases and the dashboard
    pub resource_dir: PathBuf,
}

impl CoreBinary {
    pub fn new(path: PathBuf, resource_dir: PathBuf) -> Self {
        Self { path, resource_dir }
    }

    /// `<core> -f <config> -d <resource-dir>`
    pub fn command(&self, config_path: &Path) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-f")
            .arg(config_path)
            .arg("-d")
            .arg(&self.resource_dir);
        cmd
    }

    /// Validate a config with the core's test mode, without running it
    pub async fn check_config(&self, config_path: &Path) -> bool {
        let mut cmd = self.command(config_path);
        cmd.arg("-t").stdin(Stdio::null());

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                debug!("Config {:?} passed validation", config_path);
                true
            }
            Ok(output) => {
                warn!(
                    "Config {:?} rejected by core: {}",
                    config_path,
                    String::from_utf8_lossy(&output.stdout).trim()
                );
                false
            }
            Err(e) => {
                error!("Failed to run config check: {}", e);
                false
            }
        }
    }

    /// Installed core version without the leading `v`, empty when unknown
    pub async fn version(&self) -> String {
        let output = Command::new(&self.path)
            .arg("-v")
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) => {
                extract_version(&String::from_utf8_lossy(&output.stdout)).unwrap_or_default()
            }
            Err(e) => {
                debug!("Failed to query core version: {}", e);
                String::new()
            }
        }
    }
}

/// First whitespace-separated `v<digit>...` token, without the `v`
pub fn extract_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|token| {
            let mut chars = token.chars();
            chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
        })
        .map(|token| token[1..].to_string())
}

struct ManagedProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
    watcher: JoinHandle<Option<Child>>,
}

/// Owns the single supervised core process
pub struct CoreSupervisor {
    binary: CoreBinary,
    config_path: PathBuf,
    log_path: PathBuf,
    stop_timeout: Duration,
    /// Held for the whole of `start`/`stop`, which orders them
    process: tokio::sync::Mutex<Option<ManagedProcess>>,
    state: Arc<Mutex<CoreState>>,
    hook: Arc<RwLock<Option<ExitHook>>>,
}

impl CoreSupervisor {
    pub fn new(
        binary: CoreBinary,
        config_path: PathBuf,
        log_path: PathBuf,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            config_path,
            log_path,
            stop_timeout,
            process: tokio::sync::Mutex::new(None),
            state: Arc::new(Mutex::new(CoreState::Idle)),
            hook: Arc::new(RwLock::new(None)),
        }
    }

    pub fn binary(&self) -> &CoreBinary {
        &self.binary
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Register the exit observer
    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn state(&self) -> CoreState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a child is live and has not reported an exit
    pub fn is_running(&self) -> bool {
        self.state() == CoreState::Running
    }

    /// PID of the live child
    pub async fn pid(&self) -> Option<u32> {
        if !self.is_running() {
            return None;
        }
        self.process.lock().await.as_ref().and_then(|p| p.pid)
    }

    /// Spawn the core, stopping a live one first
    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;

        if self.is_running() {
            warn!("Core already running, stopping it first");
            self.stop_locked(&mut process).await?;
        } else if let Some(stale) = process.take() {
            // The previous child exited on its own; its watcher has finished
            let _ = stale.watcher.await;
        }

        self.set_state(CoreState::Starting);
        info!(
            "Starting core {:?} with config {:?}",
            self.binary.path, self.config_path
        );

        let log = match open_log(&self.log_path) {
            Ok(log) => log,
            Err(e) => {
                self.set_state(CoreState::Idle);
                return Err(Error::fs(
                    format!("failed to open core log {}", self.log_path.display()),
                    e,
                ));
            }
        };

        let mut cmd = self.binary.command(&self.config_path);
        cmd.current_dir(&self.binary.resource_dir)
            .stdin(Stdio::null())
            .stdout(log.stdout)
            .stderr(log.stderr);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn core: {}", e);
                self.set_state(CoreState::Idle);
                return Err(Error::Spawn(e));
            }
        };
        // Our copies of the log handles close with `cmd`
        drop(cmd);

        let pid = child.id();
        info!("Core started with PID {:?}", pid);
        self.set_state(CoreState::Running);

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(
            child,
            cancel.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.hook),
        ));

        *process = Some(ManagedProcess {
            pid,
            cancel,
            watcher,
        });
        Ok(())
    }

    /// Ask the live core to terminate
    pub async fn stop(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        self.stop_locked(&mut process).await
    }

    async fn stop_locked(&self, slot: &mut Option<ManagedProcess>) -> Result<()> {
        let Some(managed) = slot.take() else {
            return Err(Error::NotRunning);
        };
        if !self.is_running() {
            let _ = managed.watcher.await;
            return Err(Error::NotRunning);
        }

        self.set_state(CoreState::Stopping);
        info!("Stopping core (PID {:?})", managed.pid);

        // Cancel the watcher so only this path reports the exit
        managed.cancel.cancel();
        let child = match managed.watcher.await {
            Ok(child) => child,
            Err(e) => {
                error!("Exit watcher failed: {}", e);
                None
            }
        };
        let Some(mut child) = child else {
            // Exited on its own before the watcher saw the cancellation
            self.set_state(CoreState::Idle);
            return Ok(());
        };

        if let Some(pid) = child.id() {
            if let Err(e) = platform::terminate_process(pid) {
                warn!("Failed to signal core: {}", e);
            }
        }

        let code = match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => exit_code(status),
            Ok(Err(e)) => {
                error!("Failed to wait for core: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Core (PID {:?}) did not exit within {:?}, leaving it",
                    managed.pid, self.stop_timeout
                );
                None
            }
        };
        info!("Core stopped with code {:?}", code);

        self.set_state(CoreState::Idle);
        notify_exit(&self.hook, code);
        Ok(())
    }

    fn set_state(&self, state: CoreState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Waits for the child; hands it back untouched when cancelled
async fn watch_exit(
    mut child: Child,
    cancel: CancellationToken,
    state: Arc<Mutex<CoreState>>,
    hook: Arc<RwLock<Option<ExitHook>>>,
) -> Option<Child> {
    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    error!("Failed to wait for core: {}", e);
                    None
                }
            };
            info!("Core exited with code {:?}", code);
            *state.lock().unwrap_or_else(PoisonError::into_inner) = CoreState::Idle;
            notify_exit(&hook, code);
            None
        }
        _ = cancel.cancelled() => Some(child),
    }
}

fn notify_exit(hook: &RwLock<Option<ExitHook>>, code: Option<i32>) {
    let hook = hook.read().unwrap_or_else(PoisonError::into_inner).clone();
    if let Some(hook) = hook {
        if std::panic::catch_unwind(AssertUnwindSafe(|| hook(code))).is_err() {
            error!("Core exit hook panicked");
        }
    }
}

/// Exit code, or the negated signal number when killed by a signal
fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| -s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

struct LogSink {
    stdout: std::fs::File,
    stderr: std::fs::File,
}

/// Fresh, truncated log file shared by stdout and stderr
fn open_log(path: &Path) -> std::io::Result<LogSink> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = std::fs::File::create(path)?;
    let stderr = stdout.try_clone()?;
    Ok(LogSink { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_version() {
        assert_eq!(
            extract_version("Mihomo Meta v1.19.10 linux amd64 with go1.24.2").as_deref(),
            Some("1.19.10")
        );
        assert_eq!(
            extract_version("version v2.0.0-alpha").as_deref(),
            Some("2.0.0-alpha")
        );
        assert_eq!(extract_version("no version here"), None);
        assert_eq!(extract_version(""), None);
    }

    #[tokio::test]
    async fn test_stop_without_child() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CoreSupervisor::new(
            CoreBinary::new(dir.path().join("core"), dir.path().to_path_buf()),
            dir.path().join("config.yaml"),
            dir.path().join("core.log"),
            Duration::from_secs(1),
        );
        assert!(matches!(supervisor.stop().await, Err(Error::NotRunning)));
        assert_eq!(supervisor.state(), CoreState::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_idle() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CoreSupervisor::new(
            CoreBinary::new(dir.path().join("missing"), dir.path().to_path_buf()),
            dir.path().join("config.yaml"),
            dir.path().join("core.log"),
            Duration::from_secs(1),
        );
        assert!(matches!(supervisor.start().await, Err(Error::Spawn(_))));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.state(), CoreState::Idle);
    }

    #[tokio::test]
    async fn test_version_of_missing_binary_is_empty() {
        let binary = CoreBinary::new(PathBuf::from("/nonexistent/core"), PathBuf::from("/"));
        assert_eq!(binary.version().await, "");
        assert!(!binary.check_config(Path::new("/nonexistent.yaml")).await);
    }
}
