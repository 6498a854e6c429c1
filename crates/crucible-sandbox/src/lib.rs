//! # crucible-sandbox
//!
//! Restricted execution of untrusted Python snippets, with a durable ledger
//! of named experiments.
//!
//! Snippets run on an embedded CPython interpreter against a namespace built
//! from a [`CapabilityCatalog`]: a fixed set of builtins, read-only proxies of
//! permitted modules, and nothing else.
//!
//! ## Security model
//!
//! - **Static validation first**: size, syntax, denylisted substrings and a
//!   structural walk over imports, calls and attribute access. Rejected
//!   snippets never reach the interpreter.
//! - **Capability namespace**: unlisted builtins are absent; `import` only
//!   resolves permitted module proxies; private and foreign submodules are
//!   stripped from those proxies.
//! - **Fresh namespace per call**: no state leaks between executions.
//! - **Deadline enforcement**: in-process runs are interrupted best-effort;
//!   [`ExecutionMode::ChildProcess`] runs are killed.
//! - **Output cap**: captured output is bounded in characters.
//! - **Audit trail**: every execution emits a redacted [`audit::AuditEntry`].

pub mod analysis;
pub mod audit;
pub mod catalog;
mod convert;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod host;
pub mod ipc;
pub mod output;
pub mod redact;
pub mod result;
mod runtime;
pub mod sandbox;
pub mod store;
pub mod syntax;
pub mod validator;

pub use analysis::{AnalysisReport, ErrorCategory};
pub use catalog::{CapabilityCatalog, CatalogBuilder};
pub use error::SandboxError;
pub use executor::{ExecutionMode, SandboxConfig, SandboxExecutor};
pub use experiment::{Experiment, ExperimentFilter, ExperimentStats, ExperimentStatus, ResultSummary};
pub use ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE;
pub use result::{ExecutionResult, FaultKind};
pub use sandbox::{Sandbox, SandboxStats};
pub use store::ExperimentStore;
pub use validator::{ValidationOutcome, Validator};
