//! The public entry point: one-shot runs, validation, and experiments.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analysis::{self, AnalysisReport};
use crate::audit::{AuditLogger, NoopAuditLogger};
use crate::error::SandboxError;
use crate::executor::{ExecutionMode, SandboxConfig, SandboxExecutor};
use crate::experiment::{Experiment, ExperimentFilter, ExperimentStats};
use crate::result::ExecutionResult;
use crate::store::ExperimentStore;
use crate::validator::ValidationOutcome;

/// Experiment counts plus the policy the sandbox enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub experiments: ExperimentStats,
    pub permitted_modules: Vec<String>,
    pub timeout_secs: f64,
    pub max_output_size: usize,
    pub execution_mode: ExecutionMode,
}

/// Validated, time-bounded snippet execution with an experiment ledger.
pub struct Sandbox {
    executor: Arc<SandboxExecutor>,
    store: ExperimentStore,
}

impl Sandbox {
    /// Open a sandbox whose experiments live in `dir`.
    pub async fn open(dir: impl Into<PathBuf>, config: SandboxConfig) -> Result<Self, SandboxError> {
        Self::with_audit_logger(dir, config, Arc::new(NoopAuditLogger)).await
    }

    /// Like [`Sandbox::open`], reporting every execution to `logger`.
    pub async fn with_audit_logger(
        dir: impl Into<PathBuf>,
        config: SandboxConfig,
        logger: Arc<dyn AuditLogger>,
    ) -> Result<Self, SandboxError> {
        let executor = Arc::new(SandboxExecutor::with_audit_logger(config, logger));
        let store = ExperimentStore::open(dir, executor.clone()).await?;
        Ok(Self { executor, store })
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// One-shot run; nothing is persisted.
    pub async fn run_code(&self, code: &str, context: &Map<String, Value>) -> ExecutionResult {
        self.executor.execute(code, context).await
    }

    pub async fn run_code_with_timeout(
        &self,
        code: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        self.executor
            .execute_with_timeout(code, context, timeout)
            .await
    }

    pub fn validate_code(&self, code: &str) -> ValidationOutcome {
        self.executor.validate(code)
    }

    pub async fn create_experiment(
        &self,
        name: &str,
        code: &str,
        description: &str,
        tags: &[String],
    ) -> Result<Experiment, SandboxError> {
        self.store.create(name, code, description, tags).await
    }

    pub async fn run_experiment(
        &self,
        id: &str,
        context: &Map<String, Value>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.store.run(id, context).await
    }

    pub async fn run_experiment_with_timeout(
        &self,
        id: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        self.store.run_with_timeout(id, context, timeout).await
    }

    pub async fn get_experiment(&self, id: &str) -> Option<Experiment> {
        self.store.get(id).await
    }

    pub async fn list_experiments(&self, filter: &ExperimentFilter) -> Vec<Experiment> {
        self.store.list(filter).await
    }

    /// Create an experiment and run it straight away.
    ///
    /// The returned experiment reflects the finished run.
    pub async fn create_and_run(
        &self,
        name: &str,
        code: &str,
        description: &str,
        context: &Map<String, Value>,
    ) -> Result<(Experiment, ExecutionResult), SandboxError> {
        let created = self.store.create(name, code, description, &[]).await?;
        let result = self.store.run(&created.id, context).await?;
        let experiment = self.store.get(&created.id).await.unwrap_or(created);
        Ok((experiment, result))
    }

    /// Advisory report over every stored experiment.
    pub async fn analyze(&self) -> AnalysisReport {
        let experiments = self.store.list(&ExperimentFilter::default()).await;
        analysis::analyze(&experiments)
    }

    pub async fn stats(&self) -> SandboxStats {
        let config = self.executor.config();
        SandboxStats {
            experiments: self.store.stats().await,
            permitted_modules: config.catalog.modules().map(str::to_string).collect(),
            timeout_secs: config.timeout.as_secs_f64(),
            max_output_size: config.max_output_size,
            execution_mode: config.execution_mode,
        }
    }
}
