//! Sandbox executor: validates a snippet, then runs it under a deadline.
//!
//! Each execution gets a brand new namespace. No state leaks between calls.
//!
//! The interpreter is driven from a dedicated `crucible-snippet` thread that
//! holds the GIL for the duration of the run. The public API is async and
//! `Send`-safe; the caller's task only waits on a oneshot channel under
//! [`tokio::time::timeout`], so the deadline holds even when the snippet
//! never yields.
//!
//! Validation also needs the interpreter lock and runs on its own thread
//! under the same deadline. A snippet stuck in native code can keep the lock
//! after its deadline; until it exits the executor reports itself degraded
//! and in-process calls come back `Unavailable` instead of hanging.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pyo3::Python;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::catalog::CapabilityCatalog;
use crate::host::SandboxHost;
use crate::output::{snapshot, OutputBuffer, SharedOutput, DEFAULT_MAX_OUTPUT_SIZE};
use crate::result::{ExecutionResult, FaultKind};
use crate::runtime;
use crate::validator::{ValidationOutcome, Validator, DEFAULT_MAX_CODE_SIZE};

/// How the sandbox executes code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the interpreter in-process on a dedicated thread (default).
    ///
    /// A snippet that ignores the injected `TimeoutError` keeps its thread
    /// alive after the deadline.
    #[default]
    InProcess,
    /// Spawn an isolated `crucible-worker` per execution. Runaway snippets are
    /// reclaimed by killing the process.
    ChildProcess,
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Deadline for one execution when the caller gives none.
    pub timeout: Duration,
    /// Captured output cap, in characters.
    pub max_output_size: usize,
    /// Maximum snippet size in bytes.
    pub max_code_size: usize,
    /// Maximum simultaneous executions.
    pub max_concurrent: usize,
    /// In-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Whether a trailing bare expression is evaluated for its value.
    pub capture_return_value: bool,
    /// Permitted builtins, modules and denied substrings.
    pub catalog: Arc<CapabilityCatalog>,
    /// Worker executable for child-process mode; discovered when `None`.
    pub worker_binary: Option<PathBuf>,
    /// Maximum IPC message size in bytes (default: 8 MB).
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_concurrent: 8,
            execution_mode: ExecutionMode::default(),
            capture_return_value: true,
            catalog: Arc::new(CapabilityCatalog::default()),
            worker_binary: None,
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// The sandbox executor.
///
/// A concurrency semaphore limits the number of simultaneous runs; a call
/// that finds it exhausted fails immediately rather than queueing.
pub struct SandboxExecutor {
    config: SandboxConfig,
    validator: Validator,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    /// Snippet threads still alive past their deadline.
    overdue: Arc<AtomicUsize>,
}

// Lifecycle of one in-process snippet thread.
const RUN_ACTIVE: u8 = 0;
const RUN_FINISHED: u8 = 1;
const RUN_OVERDUE: u8 = 2;

impl SandboxExecutor {
    /// Create an executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create an executor that reports every execution to `logger`.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let validator =
            Validator::new(config.catalog.clone()).with_max_code_size(config.max_code_size);
        Self {
            config,
            validator,
            semaphore,
            audit_logger: logger,
            overdue: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Whether an in-process snippet is still running past its deadline.
    ///
    /// While it holds the interpreter, other in-process work cannot start.
    /// [`ExecutionMode::ChildProcess`] kills runaway snippets instead.
    pub fn is_degraded(&self) -> bool {
        self.overdue.load(Ordering::SeqCst) > 0
    }

    /// Validate without running.
    ///
    /// Waits at most the configured timeout for the interpreter; a validator
    /// that cannot get it in time rejects the snippet.
    pub fn validate(&self, code: &str) -> ValidationOutcome {
        let (tx, rx) = std::sync::mpsc::channel();
        if let Err(outcome) = self.spawn_validation(code, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            return outcome;
        }
        match rx.recv_timeout(self.config.timeout) {
            Ok(outcome) => outcome,
            Err(_) => ValidationOutcome::rejected(vec![format!(
                "Analysis error: {}",
                self.busy_message(self.config.timeout)
            )]),
        }
    }

    /// Run `code` with the configured default deadline.
    pub async fn execute(&self, code: &str, context: &Map<String, Value>) -> ExecutionResult {
        self.execute_with_timeout(code, context, self.config.timeout)
            .await
    }

    /// Run `code` with an explicit deadline.
    pub async fn execute_with_timeout(
        &self,
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        self.execute_for_experiment(code, context, timeout, None)
            .await
    }

    pub(crate) async fn execute_for_experiment(
        &self,
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
        experiment_id: Option<&str>,
    ) -> ExecutionResult {
        tracing::info!(
            code_len = code.len(),
            mode = ?self.config.execution_mode,
            timeout_ms = timeout.as_millis() as u64,
            experiment_id = experiment_id.unwrap_or("-"),
            "execute: starting"
        );

        let audit_builder = AuditEntryBuilder::new(code).experiment(experiment_id);
        let result = self.validate_and_run(code, context, timeout).await;

        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;

        match (&result.fault, &result.error) {
            (None, _) => tracing::info!(
                elapsed_ms = result.execution_time.as_millis() as u64,
                "execute: complete"
            ),
            (Some(FaultKind::Rejected), Some(error)) => {
                tracing::info!(error = %error, "execute: rejected")
            }
            (Some(fault), error) => tracing::warn!(
                ?fault,
                error = error.as_deref().unwrap_or_default(),
                "execute: failed"
            ),
        }

        result
    }

    async fn validate_and_run(
        &self,
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        let start = Instant::now();

        let Some(validation) = self.validate_within(code, timeout).await else {
            let mut result = ExecutionResult::failed(
                FaultKind::Unavailable,
                self.busy_message(timeout),
                String::new(),
            );
            result.execution_time = start.elapsed();
            return result;
        };
        if !validation.is_safe {
            return ExecutionResult::rejected(&validation.issues);
        }

        let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
            return ExecutionResult::failed(
                FaultKind::Unavailable,
                format!(
                    "sandbox concurrency limit reached (max {} concurrent executions)",
                    self.config.max_concurrent
                ),
                String::new(),
            );
        };

        let mut result = match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                match SandboxHost::execute_in_child(code, context, timeout, &self.config).await {
                    Ok(result) => result,
                    Err(e) => {
                        ExecutionResult::failed(FaultKind::Unavailable, e.to_string(), String::new())
                    }
                }
            }
            ExecutionMode::InProcess => self.execute_in_process(code, context, timeout).await,
        };

        result.warnings = validation.issues;
        result.execution_time = start.elapsed();
        result
    }

    /// Validate on a detached thread, giving up after `timeout`.
    ///
    /// `None` means the interpreter lock was not available in time. The
    /// thread is detached rather than a blocking-pool task so that a lock
    /// that never frees cannot stall runtime shutdown.
    async fn validate_within(&self, code: &str, timeout: Duration) -> Option<ValidationOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Err(outcome) = self.spawn_validation(code, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            return Some(outcome);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => Some(ValidationOutcome::rejected(vec![
                "Analysis error: validator thread panicked".to_string(),
            ])),
            Err(_elapsed) => None,
        }
    }

    fn spawn_validation(
        &self,
        code: &str,
        deliver: impl FnOnce(ValidationOutcome) + Send + 'static,
    ) -> Result<(), ValidationOutcome> {
        let validator = self.validator.clone();
        let code = code.to_string();
        std::thread::Builder::new()
            .name("crucible-validate".into())
            .spawn(move || deliver(validator.validate(&code)))
            .map(|_| ())
            .map_err(|e| {
                ValidationOutcome::rejected(vec![format!(
                    "Analysis error: failed to start validator thread: {e}"
                )])
            })
    }

    fn busy_message(&self, timeout: Duration) -> String {
        let waited = timeout.as_millis();
        if self.is_degraded() {
            tracing::warn!(
                overdue = self.overdue.load(Ordering::SeqCst),
                "interpreter held by a snippet past its deadline"
            );
            format!(
                "interpreter unavailable for {waited}ms: an earlier snippet overran its \
                 deadline and still holds it; use child_process mode to isolate runaway snippets"
            )
        } else {
            format!("interpreter unavailable for {waited}ms")
        }
    }

    /// In-process execution on a dedicated snippet thread.
    async fn execute_in_process(
        &self,
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        let output: SharedOutput =
            Arc::new(Mutex::new(OutputBuffer::new(self.config.max_output_size)));
        let done = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(RUN_ACTIVE));
        let (ident_tx, ident_rx) = std::sync::mpsc::channel();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let spawned = {
            let code = code.to_string();
            let context = context.clone();
            let catalog = self.config.catalog.clone();
            let capture = self.config.capture_return_value;
            let output = output.clone();
            let done = done.clone();
            let cancelled = cancelled.clone();
            let state = state.clone();
            let overdue = self.overdue.clone();
            std::thread::Builder::new()
                .name("crucible-snippet".into())
                .spawn(move || {
                    let outcome = Python::with_gil(|py| {
                        match runtime::current_thread_ident(py) {
                            Ok(ident) => {
                                let _ = ident_tx.send(ident);
                            }
                            Err(e) => tracing::debug!(error = %e, "no interpreter thread id"),
                        }
                        // The deadline may pass while this thread waits for the lock.
                        if cancelled.load(Ordering::SeqCst) {
                            done.store(true, Ordering::SeqCst);
                            return None;
                        }
                        let outcome =
                            runtime::run_snippet(py, &code, &context, &catalog, &output, capture);
                        done.store(true, Ordering::SeqCst);
                        Some(outcome)
                    });
                    if state.swap(RUN_FINISHED, Ordering::SeqCst) == RUN_OVERDUE {
                        overdue.fetch_sub(1, Ordering::SeqCst);
                    }
                    if let Some(outcome) = outcome {
                        if tx.send(outcome).is_err() {
                            tracing::debug!("snippet finished after its deadline");
                        }
                    }
                })
        };
        if let Err(e) = spawned {
            return ExecutionResult::failed(
                FaultKind::Unavailable,
                format!("failed to start snippet thread: {e}"),
                String::new(),
            );
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                let text = snapshot(&output);
                match outcome.error {
                    None => ExecutionResult::completed(text, outcome.return_value),
                    Some(error) => ExecutionResult::failed(FaultKind::Runtime, error, text),
                }
            }
            Ok(Err(_)) => ExecutionResult::failed(
                FaultKind::Unavailable,
                "snippet thread panicked",
                snapshot(&output),
            ),
            Err(_elapsed) => {
                cancelled.store(true, Ordering::SeqCst);
                // Count before publishing so the thread never decrements first.
                self.overdue.fetch_add(1, Ordering::SeqCst);
                if state
                    .compare_exchange(RUN_ACTIVE, RUN_OVERDUE, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    self.overdue.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    overdue = self.overdue.load(Ordering::SeqCst),
                    "snippet exceeded its deadline, interrupting"
                );
                runtime::spawn_reaper(ident_rx, done);
                ExecutionResult::timed_out(timeout, snapshot(&output))
            }
        }
    }
}
