//! Experiment records: identity, status machine and persisted result summary.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::result::{duration_secs, ExecutionResult};

/// Length of an experiment id in hex characters.
pub const EXPERIMENT_ID_LEN: usize = 12;

/// Where an experiment is in its lifecycle.
///
/// `Pending` only ever appears before the first run. A run moves the record
/// to `Running`, then to `Success` or `Failed`; re-running goes through
/// `Running` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExperimentStatus {
    /// Whether a run has finished for this experiment.
    pub fn is_finished(self) -> bool {
        matches!(self, ExperimentStatus::Success | ExperimentStatus::Failed)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Success => "success",
            ExperimentStatus::Failed => "failed",
        })
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExperimentStatus::Pending),
            "running" => Ok(ExperimentStatus::Running),
            "success" => Ok(ExperimentStatus::Success),
            "failed" => Ok(ExperimentStatus::Failed),
            other => Err(format!(
                "unknown status '{other}' (expected pending, running, success or failed)"
            )),
        }
    }
}

/// The persisted part of the latest [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    pub finished_at: DateTime<Utc>,
}

impl ResultSummary {
    pub(crate) fn new(result: &ExecutionResult, finished_at: DateTime<Utc>) -> Self {
        Self {
            success: result.success,
            output: result.output.clone(),
            error: result.error.clone(),
            execution_time: result.execution_time,
            return_value: result.return_value.clone(),
            finished_at,
        }
    }
}

/// A named, stored snippet and the outcome of its latest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    /// Never changes after creation.
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub result: Option<ResultSummary>,
}

impl Experiment {
    pub(crate) fn new(
        name: &str,
        code: &str,
        description: &str,
        tags: &[String],
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut unique_tags: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique_tags.contains(tag) {
                unique_tags.push(tag.clone());
            }
        }
        Self {
            id: experiment_id(name, code, created_at),
            name: name.to_string(),
            code: code.to_string(),
            description: description.to_string(),
            status: ExperimentStatus::Pending,
            created_at,
            tags: unique_tags,
            result: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = ExperimentStatus::Running;
    }

    pub(crate) fn record(&mut self, result: &ExecutionResult, finished_at: DateTime<Utc>) {
        self.status = if result.success {
            ExperimentStatus::Success
        } else {
            ExperimentStatus::Failed
        };
        self.result = Some(ResultSummary::new(result, finished_at));
    }

    /// The contents of the `<id>.py` audit copy.
    pub fn audit_source(&self) -> String {
        format!(
            "\"\"\"\nExperiment: {}\nDescription: {}\nCreated: {}\n\"\"\"\n\n{}",
            self.name,
            self.description,
            self.created_at.to_rfc3339(),
            self.code
        )
    }
}

/// First [`EXPERIMENT_ID_LEN`] hex characters of
/// SHA-256(name ‖ code ‖ creation nanoseconds).
pub fn experiment_id(name: &str, code: &str, created_at: DateTime<Utc>) -> String {
    let nanos = created_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| created_at.timestamp_micros().saturating_mul(1000));
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(code.as_bytes());
    hasher.update(nanos.to_string().as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(EXPERIMENT_ID_LEN);
    id
}

/// Counts over every stored experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Everything not finished, including experiments caught mid-run.
    pub pending: usize,
    /// `successful / total`, zero for an empty store.
    pub success_rate: f64,
}

impl ExperimentStats {
    pub fn from_experiments<'a>(experiments: impl IntoIterator<Item = &'a Experiment>) -> Self {
        let mut stats = ExperimentStats::default();
        for experiment in experiments {
            stats.total += 1;
            match experiment.status {
                ExperimentStatus::Success => stats.successful += 1,
                ExperimentStatus::Failed => stats.failed += 1,
                ExperimentStatus::Pending | ExperimentStatus::Running => {}
            }
        }
        stats.pending = stats.total - stats.successful - stats.failed;
        if stats.total > 0 {
            stats.success_rate = stats.successful as f64 / stats.total as f64;
        }
        stats
    }
}

/// Selection for listing experiments. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
}

impl ExperimentFilter {
    pub fn with_status(status: ExperimentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn matches(&self, experiment: &Experiment) -> bool {
        self.status.map_or(true, |s| experiment.status == s)
            && self
                .tag
                .as_ref()
                .map_or(true, |t| experiment.tags.iter().any(|x| x == t))
    }
}
