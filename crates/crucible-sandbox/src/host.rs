//! Parent-side management of `crucible-worker` child processes.
//!
//! Each child-process execution spawns a fresh worker with a cleared
//! environment, sends it one [`ParentMessage::Execute`], and waits for its
//! single reply. The worker enforces the snippet deadline itself; the parent
//! allows a grace period on top for interpreter start-up and kills the child
//! if even that passes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::BufReader;
use tokio::process::Command;

use crate::error::SandboxError;
use crate::executor::SandboxConfig;
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::result::ExecutionResult;

/// Name of the worker executable.
pub const WORKER_BINARY_NAME: &str = "crucible-worker";

/// Environment variable naming the worker executable (absolute path).
pub const WORKER_BIN_ENV: &str = "CRUCIBLE_WORKER_BIN";

/// Extra time the parent waits beyond the snippet deadline.
pub const WORKER_GRACE: Duration = Duration::from_secs(2);

/// Spawns and supervises worker processes.
pub struct SandboxHost;

impl SandboxHost {
    /// Run `code` in a fresh worker.
    ///
    /// A worker that misses the deadline plus [`WORKER_GRACE`] is killed and
    /// the run reported as timed out with no output.
    pub async fn execute_in_child(
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
        config: &SandboxConfig,
    ) -> Result<ExecutionResult, SandboxError> {
        let worker_bin = find_worker_binary(config.worker_binary.as_deref())?;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var("CRUCIBLE_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::worker(format!(
                    "failed to spawn worker at {}: {e}",
                    worker_bin.display()
                ))
            })?;
        tracing::debug!(pid = ?child.id(), worker = %worker_bin.display(), "worker spawned");

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::worker("no stdin on child"))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::worker("no stdout on child"))?;
        let mut child_stdout = BufReader::new(child_stdout);

        let execute = ParentMessage::Execute {
            code: code.to_string(),
            context: context.clone(),
            config: WorkerConfig::new(config, timeout),
        };
        write_message(&mut child_stdin, &execute)
            .await
            .map_err(|e| SandboxError::Ipc(format!("failed to send Execute: {e}")))?;
        drop(child_stdin);

        let reply = tokio::time::timeout(
            timeout + WORKER_GRACE,
            read_message_with_limit::<ChildMessage, _>(&mut child_stdout, config.max_ipc_message_size),
        )
        .await;

        match reply {
            Ok(Ok(Some(ChildMessage::ExecutionComplete { result }))) => {
                let _ = child.wait().await;
                Ok(result)
            }
            Ok(Ok(Some(ChildMessage::Fault { message }))) => {
                let _ = child.wait().await;
                Err(SandboxError::worker(message))
            }
            Ok(Ok(None)) => {
                let status = child.wait().await.ok();
                Err(SandboxError::worker(format!(
                    "worker exited without sending a result (status: {status:?})"
                )))
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(SandboxError::Ipc(format!("IPC read error: {e}")))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "worker missed its deadline, killing it"
                );
                let _ = child.kill().await;
                Ok(ExecutionResult::timed_out(timeout, String::new()))
            }
        }
    }
}

/// Find the worker executable.
///
/// Search order:
/// 1. `explicit`, when configured
/// 2. `CRUCIBLE_WORKER_BIN` (must be an absolute path)
/// 3. Next to the current executable, or one directory up (test binaries
///    live in `target/<profile>/deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary(explicit: Option<&Path>) -> Result<PathBuf, SandboxError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(SandboxError::worker(format!(
                "configured worker binary {} does not exist",
                path.display()
            )));
        }
        validate_binary_permissions(path)?;
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::worker(format!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BINARY_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::worker(format!(
        "{WORKER_BINARY_NAME} binary not found; set {WORKER_BIN_ENV} or install it alongside crucible"
    )))
}

/// Reject world-writable worker binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| SandboxError::io(_path, e))?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::worker(format!(
                "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
                _path.display()
            )));
        }
    }
    Ok(())
}
