#![warn(missing_docs)]

//! # crucible-config
//!
//! Configuration loading for the Crucible sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 5
//! max_output_size = 10000
//! max_concurrent = 4
//! execution_mode = "child_process"
//!
//! [catalog]
//! extra_modules = ["heapq"]
//! remove_modules = ["random"]
//!
//! [store]
//! directory = "${HOME}/.crucible/experiments"
//!
//! [audit]
//! path = "crucible-audit.jsonl"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Crucible configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrucibleConfig {
    /// Execution limits and mode.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Adjustments to the default capability catalog.
    #[serde(default)]
    pub catalog: CatalogOverrides,

    /// Experiment storage.
    #[serde(default)]
    pub store: StoreConfig,

    /// Audit log destination.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Sandbox configuration overrides. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Execution timeout in seconds; fractions allowed.
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Captured output cap in characters.
    #[serde(default)]
    pub max_output_size: Option<usize>,

    /// Maximum snippet size in bytes.
    #[serde(default)]
    pub max_code_size: Option<usize>,

    /// Maximum concurrent executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Whether a trailing expression's value is captured.
    #[serde(default)]
    pub capture_return_value: Option<bool>,

    /// Path to the `crucible-worker` executable.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
}

/// Changes applied on top of the default capability catalog.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogOverrides {
    /// Module roots to permit in addition to the defaults.
    #[serde(default)]
    pub extra_modules: Vec<String>,

    /// Default module roots to withdraw.
    #[serde(default)]
    pub remove_modules: Vec<String>,

    /// Builtins to expose in addition to the defaults.
    #[serde(default)]
    pub extra_builtins: Vec<String>,

    /// Default builtins to withdraw.
    #[serde(default)]
    pub remove_builtins: Vec<String>,

    /// Extra substrings to reject.
    #[serde(default)]
    pub extra_denied_patterns: Vec<String>,
}

/// Where experiments are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Experiment directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Audit log settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// JSON-lines file audit entries are appended to.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

const EXECUTION_MODES: &[&str] = &["in_process", "child_process"];

impl CrucibleConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CrucibleConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if let Some(secs) = sandbox.timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.timeout_secs must be a positive number, got {secs}"
                )));
            }
        }
        for (field, value) in [
            ("max_output_size", sandbox.max_output_size),
            ("max_code_size", sandbox.max_code_size),
            ("max_concurrent", sandbox.max_concurrent),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{field} must be greater than zero"
                )));
            }
        }
        if let Some(mode) = &sandbox.execution_mode {
            if !EXECUTION_MODES.contains(&mode.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unsupported sandbox.execution_mode '{mode}', supported: {}",
                    EXECUTION_MODES.join(", ")
                )));
            }
        }
        if let Some(dir) = &self.store.directory {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "store.directory must not be empty".into(),
                ));
            }
        }
        for module in self
            .catalog
            .extra_modules
            .iter()
            .chain(&self.catalog.remove_modules)
        {
            if module.is_empty() || module.contains('.') {
                return Err(ConfigError::Invalid(format!(
                    "catalog module '{module}' must be a top-level module name"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders stay as written.
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
