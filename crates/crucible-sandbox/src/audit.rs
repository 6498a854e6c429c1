//! Audit logging for snippet executions.
//!
//! Every call through [`SandboxExecutor`](crate::SandboxExecutor) emits one
//! [`AuditEntry`] carrying:
//! - an execution id (UUID)
//! - the SHA-256 of the code, plus a redacted preview of its first 500 bytes
//! - the experiment it ran for, if any
//! - duration, output size and outcome
//!
//! Backends implement [`AuditLogger`]; [`JsonLinesAuditLogger`] appends one
//! JSON object per line to a file or any other `AsyncWrite`.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::redact::redact_secrets;
use crate::result::{ExecutionResult, FaultKind};

/// Bytes of source kept in `code_preview`.
const CODE_PREVIEW_MAX: usize = 500;

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// UUID v4, one per execution.
    pub execution_id: String,
    /// When the execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the submitted code.
    pub code_hash: String,
    /// Redacted head of the code, for human review.
    pub code_preview: String,
    /// Experiment the run belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Characters of captured output.
    pub output_chars: usize,
    /// Number of validator warnings attached to the result.
    pub warnings: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// How an audited execution ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Ran to completion.
    Success,
    /// Refused by the validator.
    Rejected {
        /// Validator issues.
        issues: Vec<String>,
    },
    /// Raised, or could not be hosted.
    Error {
        /// Redacted diagnostic.
        message: String,
    },
    /// Exceeded its deadline.
    Timeout,
}

/// Sink for audit entries. Implementations must not fail the execution.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Record `entry`.
    async fn log(&self, entry: &AuditEntry);
}

/// JSON-lines audit sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a logger writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl JsonLinesAuditLogger<tokio::fs::File> {
    /// Open `path` for appending, creating it if needed.
    pub async fn append_to(path: &Path) -> Result<Self, SandboxError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SandboxError::io(path, e))?;
        Ok(Self::new(file))
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Discards every entry.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as `INFO` events with `audit = true`.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Rejected { .. } => "rejected",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            experiment_id = entry.experiment_id.as_deref().unwrap_or("-"),
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            output_chars = entry.output_chars,
            warnings = entry.warnings,
            outcome,
            "audit"
        );
    }
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// First [`CODE_PREVIEW_MAX`] bytes of `code`, cut on a char boundary, with
/// `...` appended when truncated.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

/// Collects audit fields while an execution is in flight.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    experiment_id: Option<String>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start an entry for `code`.
    pub fn new(code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: redact_secrets(&code_preview(code)),
            experiment_id: None,
            start: Instant::now(),
        }
    }

    /// Tie the entry to an experiment.
    pub fn experiment(mut self, id: Option<&str>) -> Self {
        self.experiment_id = id.map(str::to_string);
        self
    }

    /// Finalize the entry with the execution result.
    pub fn finish(self, result: &ExecutionResult) -> AuditEntry {
        let outcome = match (result.success, result.fault) {
            (true, _) => AuditOutcome::Success,
            (false, Some(FaultKind::Timeout)) => AuditOutcome::Timeout,
            (false, Some(FaultKind::Rejected)) => AuditOutcome::Rejected {
                issues: rejection_issues(result),
            },
            (false, _) => AuditOutcome::Error {
                message: redact_secrets(result.error.as_deref().unwrap_or_default()),
            },
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            experiment_id: self.experiment_id,
            duration_ms: self.start.elapsed().as_millis() as u64,
            output_chars: result.output.chars().count(),
            warnings: result.warnings.len(),
            outcome,
        }
    }
}

fn rejection_issues(result: &ExecutionResult) -> Vec<String> {
    let error = result.error.as_deref().unwrap_or_default();
    error
        .strip_prefix("Validation failed: ")
        .unwrap_or(error)
        .split("; ")
        .map(redact_secrets)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn sha256_of_hello_matches_known_digest() {
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn short_snippet_preview_is_whole() {
        let code = "print(42)";
        assert_eq!(code_preview(code), code);
    }

    #[test]
    fn long_snippet_preview_is_cut_with_ellipsis() {
        let preview = code_preview(&"x".repeat(1000));
        assert_eq!(preview.len(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn preview_never_splits_a_multibyte_char() {
        let mut code = "a".repeat(499);
        code.push('\u{1F600}');
        code.push_str(&"b".repeat(100));
        let preview = code_preview(&code);
        assert_eq!(preview, format!("{}...", "a".repeat(499)));
    }

    #[test]
    fn builder_records_success() {
        let entry = AuditEntryBuilder::new("print(1)")
            .experiment(Some("abc123"))
            .finish(&ExecutionResult::completed("1\n".into(), None));
        assert!(!entry.execution_id.is_empty());
        assert_eq!(entry.experiment_id.as_deref(), Some("abc123"));
        assert_eq!(entry.output_chars, 2);
        assert_eq!(entry.outcome, AuditOutcome::Success);
    }

    #[test]
    fn builder_splits_rejection_issues() {
        let result = ExecutionResult::rejected(&[
            "Import blocked: os".into(),
            "Dangerous function: open".into(),
        ]);
        let entry = AuditEntryBuilder::new("import os").finish(&result);
        assert_eq!(
            entry.outcome,
            AuditOutcome::Rejected {
                issues: vec!["Import blocked: os".into(), "Dangerous function: open".into()]
            }
        );
    }

    #[test]
    fn builder_records_timeout() {
        let result = ExecutionResult::timed_out(Duration::from_millis(100), String::new());
        let entry = AuditEntryBuilder::new("while True: pass").finish(&result);
        assert_eq!(entry.outcome, AuditOutcome::Timeout);
    }

    #[test]
    fn preview_and_errors_are_redacted() {
        let code = "token = 'abc123'\nraise ValueError(token)";
        let result = ExecutionResult::failed(
            FaultKind::Runtime,
            "ValueError: password=hunter2",
            String::new(),
        );
        let entry = AuditEntryBuilder::new(code).finish(&result);
        assert!(!entry.code_preview.contains("abc123"));
        match entry.outcome {
            AuditOutcome::Error { message } => assert!(!message.contains("hunter2"), "{message}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_lines_logger_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("log.jsonl");
        let logger = JsonLinesAuditLogger::append_to(&path).await.unwrap();
        for _ in 0..2 {
            let entry =
                AuditEntryBuilder::new("1").finish(&ExecutionResult::completed(String::new(), None));
            logger.log(&entry).await;
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["outcome"]["status"], "success");
    }
}
