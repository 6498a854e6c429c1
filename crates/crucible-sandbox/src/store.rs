//! Durable experiment store.
//!
//! Layout of the experiment directory:
//!
//! ```text
//! experiments.json   {"experiments": [...], "updated_at": "..."}
//! <id>.py            docstring header followed by the experiment's code
//! ```
//!
//! All mutations run under one async mutex and are persisted before they
//! become visible: the next state is built on a copy, written to a temporary
//! file in the same directory and renamed over the index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::SandboxError;
use crate::executor::SandboxExecutor;
use crate::experiment::{Experiment, ExperimentFilter, ExperimentStats, ExperimentStatus};
use crate::result::ExecutionResult;

/// Name of the index file inside the experiment directory.
pub const INDEX_FILE: &str = "experiments.json";

#[derive(Deserialize)]
struct IndexFile {
    experiments: Vec<Experiment>,
}

/// Stores experiments and runs them through a shared executor.
pub struct ExperimentStore {
    dir: PathBuf,
    index_path: PathBuf,
    executor: Arc<SandboxExecutor>,
    experiments: Mutex<Vec<Experiment>>,
}

impl ExperimentStore {
    /// Open (or create) the store rooted at `dir`.
    ///
    /// A missing index means an empty store. An index that exists but does
    /// not decode is [`SandboxError::CorruptIndex`].
    pub async fn open(
        dir: impl Into<PathBuf>,
        executor: Arc<SandboxExecutor>,
    ) -> Result<Self, SandboxError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::io(&dir, e))?;
        let index_path = dir.join(INDEX_FILE);

        let experiments = match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let index: IndexFile =
                    serde_json::from_slice(&bytes).map_err(|source| SandboxError::CorruptIndex {
                        path: index_path.clone(),
                        source,
                    })?;
                index.experiments
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SandboxError::io(&index_path, e)),
        };
        tracing::debug!(
            dir = %dir.display(),
            experiments = experiments.len(),
            "experiment store opened"
        );

        Ok(Self {
            dir,
            index_path,
            executor,
            experiments: Mutex::new(experiments),
        })
    }

    /// Directory the store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The executor experiments run on.
    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    /// Record a new `pending` experiment and write its audit copy.
    pub async fn create(
        &self,
        name: &str,
        code: &str,
        description: &str,
        tags: &[String],
    ) -> Result<Experiment, SandboxError> {
        let mut guard = self.experiments.lock().await;

        let mut created_at = Utc::now();
        let mut experiment = Experiment::new(name, code, description, tags, created_at);
        while guard.iter().any(|e| e.id == experiment.id) {
            created_at += chrono::Duration::nanoseconds(1);
            experiment = Experiment::new(name, code, description, tags, created_at);
        }

        let source_path = self.dir.join(format!("{}.py", experiment.id));
        tokio::fs::write(&source_path, experiment.audit_source())
            .await
            .map_err(|e| SandboxError::io(&source_path, e))?;

        let mut next = guard.clone();
        next.push(experiment.clone());
        if let Err(e) = self.persist(&next).await {
            if let Err(cleanup) = tokio::fs::remove_file(&source_path).await {
                tracing::warn!(
                    path = %source_path.display(),
                    error = %cleanup,
                    "could not remove source of unrecorded experiment"
                );
            }
            return Err(e);
        }
        *guard = next;

        tracing::info!(id = %experiment.id, name, "experiment created");
        Ok(experiment)
    }

    /// Run an experiment with the executor's default deadline.
    pub async fn run(
        &self,
        id: &str,
        context: &Map<String, Value>,
    ) -> Result<ExecutionResult, SandboxError> {
        let timeout = self.executor.config().timeout;
        self.run_with_timeout(id, context, timeout).await
    }

    /// Run an experiment and record the outcome.
    ///
    /// An unknown id is a data result, not an error. The status is persisted
    /// as `running` before the snippet starts and as `success`/`failed` after.
    pub async fn run_with_timeout(
        &self,
        id: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let code = {
            let mut guard = self.experiments.lock().await;
            let Some(pos) = guard.iter().position(|e| e.id == id) else {
                tracing::debug!(id, "run requested for unknown experiment");
                return Ok(ExecutionResult::not_found(id));
            };
            let mut next = guard.clone();
            next[pos].mark_running();
            self.persist(&next).await?;
            *guard = next;
            guard[pos].code.clone()
        };

        let result = self
            .executor
            .execute_for_experiment(&code, context, timeout, Some(id))
            .await;

        let mut guard = self.experiments.lock().await;
        let mut next = guard.clone();
        if let Some(experiment) = next.iter_mut().find(|e| e.id == id) {
            experiment.record(&result, Utc::now());
        }
        self.persist(&next).await?;
        *guard = next;

        tracing::info!(id, success = result.success, "experiment finished");
        Ok(result)
    }

    /// Look up one experiment.
    pub async fn get(&self, id: &str) -> Option<Experiment> {
        self.experiments
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Experiments matching `filter`, newest first.
    pub async fn list(&self, filter: &ExperimentFilter) -> Vec<Experiment> {
        let guard = self.experiments.lock().await;
        let mut matching: Vec<Experiment> =
            guard.iter().filter(|e| filter.matches(e)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    pub async fn list_by_status(&self, status: ExperimentStatus) -> Vec<Experiment> {
        self.list(&ExperimentFilter::with_status(status)).await
    }

    /// The `n` most recently created experiments.
    pub async fn list_recent(&self, n: usize) -> Vec<Experiment> {
        self.list(&ExperimentFilter::recent(n)).await
    }

    pub async fn stats(&self) -> ExperimentStats {
        ExperimentStats::from_experiments(self.experiments.lock().await.iter())
    }

    async fn persist(&self, experiments: &[Experiment]) -> Result<(), SandboxError> {
        #[derive(Serialize)]
        struct IndexRef<'a> {
            experiments: &'a [Experiment],
            updated_at: DateTime<Utc>,
        }

        let bytes = serde_json::to_vec_pretty(&IndexRef {
            experiments,
            updated_at: Utc::now(),
        })?;
        let tmp = self
            .dir
            .join(format!(".{INDEX_FILE}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SandboxError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.index_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SandboxError::io(&self.index_path, e));
        }
        tracing::debug!(count = experiments.len(), "experiment index written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::executor::SandboxConfig;
    use crate::result::FaultKind;

    async fn open(dir: &Path) -> ExperimentStore {
        let executor = Arc::new(SandboxExecutor::new(SandboxConfig::default()));
        ExperimentStore::open(dir, executor).await.unwrap()
    }

    #[tokio::test]
    async fn create_writes_index_and_audit_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let exp = store
            .create("square", "7 * 7", "squares seven", &["math".into()])
            .await
            .unwrap();

        assert_eq!(exp.status, ExperimentStatus::Pending);
        let source = std::fs::read_to_string(dir.path().join(format!("{}.py", exp.id))).unwrap();
        assert!(source.contains("Experiment: square"));
        assert!(source.ends_with("7 * 7"));

        let index: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(index["experiments"][0]["id"], json!(exp.id));
        assert!(index["updated_at"].is_string());
    }

    #[tokio::test]
    async fn run_records_result_and_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let exp = store.create("square", "n * n", "", &[]).await.unwrap();

        let result = store
            .run(&exp.id, json!({"n": 9}).as_object().unwrap())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);

        let stored = store.get(&exp.id).await.unwrap();
        assert_eq!(stored.id, exp.id);
        assert_eq!(stored.status, ExperimentStatus::Success);
        let summary = stored.result.unwrap();
        assert_eq!(summary.return_value, Some(json!(81)));
        assert_eq!(summary.execution_time, result.execution_time);
    }

    #[tokio::test]
    async fn rerun_never_returns_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let exp = store.create("flaky", "1 / n", "", &[]).await.unwrap();

        store
            .run(&exp.id, json!({"n": 0}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(store.get(&exp.id).await.unwrap().status, ExperimentStatus::Failed);

        store
            .run(&exp.id, json!({"n": 2}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(store.get(&exp.id).await.unwrap().status, ExperimentStatus::Success);
    }

    #[tokio::test]
    async fn concurrent_runs_both_land_in_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let store = open(dir.path()).await;
            let a = store.create("double", "n * 2", "", &[]).await.unwrap();
            let b = store.create("triple", "n * 3", "", &[]).await.unwrap();
            let ctx = json!({"n": 5}).as_object().cloned().unwrap();

            let (ra, rb) = tokio::join!(store.run(&a.id, &ctx), store.run(&b.id, &ctx));
            assert!(ra.unwrap().success);
            assert!(rb.unwrap().success);
            (a.id, b.id)
        };

        let store = open(dir.path()).await;
        for (id, expected) in [(a, 10), (b, 15)] {
            let exp = store.get(&id).await.unwrap();
            assert_eq!(exp.status, ExperimentStatus::Success, "{id}");
            assert_eq!(exp.result.unwrap().return_value, Some(json!(expected)));
        }
    }

    #[tokio::test]
    async fn failed_create_leaves_no_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        // A non-empty directory in place of the index makes the rename fail.
        std::fs::create_dir(dir.path().join(INDEX_FILE)).unwrap();
        std::fs::write(dir.path().join(INDEX_FILE).join("keep"), b"").unwrap();

        let err = store.create("lost", "1", "", &[]).await.err().unwrap();
        assert!(matches!(err, SandboxError::Io { .. }), "{err}");
        assert!(store.list_recent(10).await.is_empty());
        let sources: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".py"))
            .collect();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_a_data_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let result = store.run("deadbeef0000", &Map::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.fault, Some(FaultKind::NotFound));
        assert_eq!(result.error.as_deref(), Some("Experiment deadbeef0000 not found"));
    }

    #[tokio::test]
    async fn rejected_experiment_is_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let exp = store.create("net", "import socket", "", &[]).await.unwrap();
        let result = store.run(&exp.id, &Map::new()).await.unwrap();
        assert_eq!(result.fault, Some(FaultKind::Rejected));
        assert_eq!(store.get(&exp.id).await.unwrap().status, ExperimentStatus::Failed);
    }

    #[tokio::test]
    async fn reopen_reloads_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = open(dir.path()).await;
            let exp = store.create("one", "1", "", &[]).await.unwrap();
            store.run(&exp.id, &Map::new()).await.unwrap();
            exp.id
        };
        let store = open(dir.path()).await;
        let exp = store.get(&id).await.unwrap();
        assert_eq!(exp.status, ExperimentStatus::Success);
        assert_eq!(store.stats().await.total, 1);
    }

    #[tokio::test]
    async fn corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();
        let executor = Arc::new(SandboxExecutor::new(SandboxConfig::default()));
        let err = ExperimentStore::open(dir.path(), executor)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::CorruptIndex { .. }), "{err}");
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_filterable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let first = store.create("a", "1", "", &["x".into()]).await.unwrap();
        let second = store.create("b", "2", "", &[]).await.unwrap();
        let third = store.create("c", "3", "", &["x".into()]).await.unwrap();
        store.run(&second.id, &Map::new()).await.unwrap();

        let recent: Vec<String> = store.list_recent(2).await.into_iter().map(|e| e.id).collect();
        assert_eq!(recent, vec![third.id.clone(), second.id.clone()]);

        let done = store.list_by_status(ExperimentStatus::Success).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, second.id);

        let tagged = store
            .list(&ExperimentFilter {
                tag: Some("x".into()),
                ..Default::default()
            })
            .await;
        let ids: Vec<&str> = tagged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn no_temporary_files_are_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create("a", "1", "", &[]).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
