//! VPN bridge backed by a supervised tun2socks process

use super::{DisconnectCallback, VpnBridge};
use crate::config::VpnConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOOPBACK: &str = "127.0.0.1";

/// Format a Command for display
fn format_command(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<String> = cmd
        .get_args()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

struct Binding {
    id: u64,
    port: u16,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<Binding>>>;

fn lock(slot: &Mutex<Option<Binding>>) -> MutexGuard<'_, Option<Binding>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs tun2socks against the local SOCKS endpoint and reports when it dies
pub struct Tun2SocksBridge {
    config: VpnConfig,
    binding: Slot,
    next_id: AtomicU64,
    start_lock: tokio::sync::Mutex<()>,
}

impl Tun2SocksBridge {
    pub fn new(config: VpnConfig) -> Self {
        Self {
            config,
            binding: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.binding).is_some()
    }

    fn command(&self, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.tun2socks_path);
        cmd.args(self.config.expand_args(LOOPBACK, port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> SessionError {
        let path = &self.config.tun2socks_path;
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                SessionError::DeviceUnavailable(format!("{} not found", path))
            }
            std::io::ErrorKind::PermissionDenied => {
                SessionError::PermissionDenied(format!("cannot execute {}: {}", path, e))
            }
            _ => SessionError::DeviceUnavailable(format!("failed to start {}: {}", path, e)),
        }
    }
}

#[async_trait]
impl VpnBridge for Tun2SocksBridge {
    async fn start(&self, port: u16, on_disconnect: DisconnectCallback) -> Result<String> {
        let _starting = self.start_lock.lock().await;
        if self.is_bound() {
            return Err(SessionError::AlreadyBound);
        }

        let mut command = self.command(port);
        info!("Starting VPN device: {}", format_command(&command));

        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(collect_stderr(s)));

        // A device that cannot be configured exits almost immediately
        if let Ok(status) = tokio::time::timeout(self.config.startup_grace(), child.wait()).await {
            let last = last_line(stderr).await;
            let reason = describe_exit(status, last);
            warn!("VPN device failed to start: {}", reason);
            return Err(classify_failure(reason));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        // Insert under the lock so the supervisor always finds its binding
        {
            let mut slot = lock(&self.binding);
            let supervisor = tokio::spawn(supervise(
                child,
                stderr,
                id,
                cancel.clone(),
                self.binding.clone(),
                on_disconnect,
            ));
            *slot = Some(Binding {
                id,
                port,
                cancel,
                supervisor,
            });
        }

        Ok(format!(
            "{} bound to {}:{}",
            self.config.device, LOOPBACK, port
        ))
    }

    async fn stop(&self) -> Result<String> {
        let binding = lock(&self.binding).take();

        match binding {
            Some(binding) => {
                binding.cancel.cancel();
                if let Err(e) = binding.supervisor.await {
                    warn!("VPN supervisor ended abnormally: {}", e);
                }
                info!("VPN device {} released", self.config.device);
                Ok(format!(
                    "{} unbound from port {}",
                    self.config.device, binding.port
                ))
            }
            None => Ok(format!("{} not bound", self.config.device)),
        }
    }
}

impl Drop for Tun2SocksBridge {
    fn drop(&mut self) {
        if let Some(binding) = lock(&self.binding).take() {
            binding.cancel.cancel();
        }
    }
}

/// Wait for the child to exit or for the binding to be cancelled
async fn supervise(
    mut child: Child,
    stderr: Option<JoinHandle<Option<String>>>,
    id: u64,
    cancel: CancellationToken,
    slot: Slot,
    on_disconnect: DisconnectCallback,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tun2socks: {}", e);
            }
            if let Some(task) = stderr {
                task.abort();
            }
            debug!("VPN binding {} cancelled", id);
        }
        status = child.wait() => {
            let reason = describe_exit(status, last_line(stderr).await);

            // stop() takes the binding first, so whoever removes it owns the outcome
            let owned = {
                let mut guard = lock(&slot);
                if guard.as_ref().map(|b| b.id) == Some(id) {
                    guard.take();
                    true
                } else {
                    false
                }
            };

            if owned {
                warn!("VPN device exited unexpectedly: {}", reason);
                on_disconnect(reason);
            } else {
                debug!("VPN binding {} exited after stop: {}", id, reason);
            }
        }
    }
}

/// Log tun2socks output and keep its last line for error reporting
async fn collect_stderr(stderr: ChildStderr) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if !line.is_empty() {
            debug!("tun2socks: {}", line);
            last = Some(line);
        }
    }

    last
}

async fn last_line(task: Option<JoinHandle<Option<String>>>) -> Option<String> {
    let task = task?;
    match tokio::time::timeout(Duration::from_secs(1), task).await {
        Ok(Ok(line)) => line,
        _ => None,
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>, last_line: Option<String>) -> String {
    match (last_line, status) {
        (Some(line), _) => line,
        (None, Ok(status)) => format!("tun2socks exited with {}", status),
        (None, Err(e)) => format!("failed to wait for tun2socks: {}", e),
    }
}

fn classify_failure(reason: String) -> SessionError {
    let lower = reason.to_lowercase();
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        SessionError::PermissionDenied(reason)
    } else {
        SessionError::DeviceUnavailable(reason)
    }
}
