//! Crucible command line.
//!
//! Validates and runs untrusted Python snippets, and manages the experiment
//! ledger. Logs go to stderr; results go to stdout, as JSON with `--json`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crucible_config::{CatalogOverrides, CrucibleConfig, SandboxOverrides};
use crucible_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use crucible_sandbox::{
    CapabilityCatalog, ExecutionMode, ExecutionResult, Experiment, ExperimentFilter,
    ExperimentStatus, Sandbox, SandboxConfig, ValidationOutcome,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Store directory used when neither the flag nor the config names one.
const DEFAULT_STORE_DIR: &str = "crucible_experiments";

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validated, time-bounded Python snippet sandbox", long_about = None)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: $CRUCIBLE_CONFIG, then ./crucible.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Experiment directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Execution timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Execution mode
    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    InProcess,
    ChildProcess,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::InProcess => ExecutionMode::InProcess,
            ModeArg::ChildProcess => ExecutionMode::ChildProcess,
        }
    }
}

/// Where snippet source comes from.
#[derive(Args, Debug)]
struct CodeSource {
    /// Snippet source; `-` reads stdin
    #[arg(conflicts_with = "path")]
    code: Option<String>,

    /// Read the snippet from a file
    #[arg(short = 'f', long = "path")]
    path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a snippet without running it
    Validate {
        #[command(flatten)]
        source: CodeSource,
    },

    /// Run a snippet once; nothing is stored
    Run {
        #[command(flatten)]
        source: CodeSource,

        /// Bindings as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// Manage stored experiments
    Experiment {
        #[command(subcommand)]
        action: ExperimentAction,
    },

    /// Summarise stored experiments
    Analyze,

    /// Experiment counts and sandbox policy
    Stats,
}

#[derive(Subcommand)]
enum ExperimentAction {
    /// Store a new experiment
    Create {
        /// Experiment name
        #[arg(short, long)]
        name: String,

        /// Free-form description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[command(flatten)]
        source: CodeSource,

        /// Run it immediately
        #[arg(long)]
        run: bool,

        /// Bindings as a JSON object (with --run)
        #[arg(long, requires = "run")]
        context: Option<String>,
    },

    /// Run a stored experiment
    Run {
        /// Experiment id
        id: String,

        /// Bindings as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// Show one experiment
    Show {
        /// Experiment id
        id: String,
    },

    /// List experiments, newest first
    List {
        /// Only this status
        #[arg(long)]
        status: Option<ExperimentStatus>,

        /// Only experiments carrying this tag
        #[arg(long)]
        tag: Option<String>,

        /// At most this many
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(
    overrides: &SandboxOverrides,
    catalog: &CatalogOverrides,
) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(secs) = overrides.timeout_secs {
        config.timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid timeout {secs}"))?;
    }
    if let Some(size) = overrides.max_output_size {
        config.max_output_size = size;
    }
    if let Some(size) = overrides.max_code_size {
        config.max_code_size = size;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = match mode.as_str() {
            "child_process" => ExecutionMode::ChildProcess,
            _ => ExecutionMode::InProcess,
        };
    }
    if let Some(capture) = overrides.capture_return_value {
        config.capture_return_value = capture;
    }
    if let Some(ref path) = overrides.worker_binary {
        config.worker_binary = Some(path.clone());
    }
    config.catalog = Arc::new(build_catalog(catalog));
    Ok(config)
}

/// Apply catalog overrides on top of the default catalog.
fn build_catalog(overrides: &CatalogOverrides) -> CapabilityCatalog {
    let mut builder = CapabilityCatalog::builder();
    for module in &overrides.extra_modules {
        builder = builder.allow_module(module.as_str());
    }
    for module in &overrides.remove_modules {
        builder = builder.remove_module(module);
    }
    for name in &overrides.extra_builtins {
        builder = builder.allow_builtin(name.as_str());
    }
    for name in &overrides.remove_builtins {
        builder = builder.remove_builtin(name);
    }
    for pattern in &overrides.extra_denied_patterns {
        builder = builder.deny_pattern(pattern.as_str());
    }
    builder.build()
}

/// Find the config file: `--config`, then `CRUCIBLE_CONFIG`, then `./crucible.toml`.
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("CRUCIBLE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("crucible.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<CrucibleConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            CrucibleConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => Ok(CrucibleConfig::default()),
    }
}

fn read_code(source: &CodeSource) -> Result<String> {
    match (&source.code, &source.path) {
        (_, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        (Some(code), None) if code == "-" => {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
                .context("failed to read snippet from stdin")?;
            Ok(buf)
        }
        (Some(code), None) => Ok(code.clone()),
        (None, None) => bail!("no snippet given; pass it as an argument, with --path, or '-' for stdin"),
    }
}

fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_validation(outcome: &ValidationOutcome) {
    if outcome.is_safe {
        println!("safe");
        for issue in &outcome.issues {
            println!("warning: {issue}");
        }
    } else {
        println!("rejected");
        for issue in &outcome.issues {
            println!("  - {issue}");
        }
    }
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.output);
    if !result.output.is_empty() && !result.output.ends_with('\n') {
        println!();
    }
    if let Some(value) = &result.return_value {
        println!("=> {value}");
    }
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(error) = &result.error {
        eprintln!("error: {}", error.trim_end());
    }
    eprintln!("({:.3}s)", result.execution_time.as_secs_f64());
}

fn print_experiment(experiment: &Experiment) {
    println!("{}  {}  [{}]", experiment.id, experiment.name, experiment.status);
    if !experiment.description.is_empty() {
        println!("  {}", experiment.description);
    }
    if !experiment.tags.is_empty() {
        println!("  tags: {}", experiment.tags.join(", "));
    }
    println!("  created: {}", experiment.created_at.to_rfc3339());
    if let Some(result) = &experiment.result {
        println!(
            "  last run: {} in {:.3}s at {}",
            if result.success { "success" } else { "failed" },
            result.execution_time.as_secs_f64(),
            result.finished_at.to_rfc3339()
        );
        if let Some(error) = &result.error {
            println!("  error: {}", error.lines().last().unwrap_or_default());
        }
    }
}

fn exit_for(result: &ExecutionResult) -> ExitCode {
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn open_sandbox(cli: &Cli, config: &CrucibleConfig) -> Result<Sandbox> {
    let mut sandbox_config = build_sandbox_config(&config.sandbox, &config.catalog)?;
    if let Some(secs) = cli.timeout {
        sandbox_config.timeout = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .with_context(|| format!("--timeout must be a positive number, got {secs}"))?;
    }
    if let Some(mode) = cli.mode {
        sandbox_config.execution_mode = mode.into();
    }

    let logger: Arc<dyn AuditLogger> = match &config.audit.path {
        Some(path) => Arc::new(JsonLinesAuditLogger::append_to(path).await?),
        None => Arc::new(TracingAuditLogger),
    };

    let dir = cli
        .store
        .clone()
        .or_else(|| config.store.directory.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
    tracing::debug!(store = %dir.display(), mode = ?sandbox_config.execution_mode, "opening sandbox");

    Ok(Sandbox::with_audit_logger(dir, sandbox_config, logger).await?)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let sandbox = open_sandbox(&cli, &config).await?;

    match &cli.command {
        Commands::Validate { source } => {
            let code = read_code(source)?;
            let outcome = sandbox.validate_code(&code);
            if cli.json {
                emit_json(&outcome)?;
            } else {
                print_validation(&outcome);
            }
            Ok(if outcome.is_safe {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Run { source, context } => {
            let code = read_code(source)?;
            let context = parse_context(context.as_deref())?;
            let result = sandbox.run_code(&code, &context).await;
            if cli.json {
                emit_json(&result)?;
            } else {
                print_result(&result);
            }
            Ok(exit_for(&result))
        }
        Commands::Experiment { action } => run_experiment_action(&cli, &sandbox, action).await,
        Commands::Analyze => {
            let report = sandbox.analyze().await;
            if cli.json {
                emit_json(&report)?;
            } else {
                println!(
                    "{} experiments, {:.0}% successful",
                    report.total,
                    report.success_rate * 100.0
                );
                for category in &report.common_errors {
                    println!("  {:>4}  {}", category.count, category.category);
                }
                for insight in &report.insights {
                    println!("* {insight}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let stats = sandbox.stats().await;
            if cli.json {
                emit_json(&stats)?;
            } else {
                let e = &stats.experiments;
                println!(
                    "experiments: {} total, {} successful, {} failed, {} pending ({:.0}% success)",
                    e.total,
                    e.successful,
                    e.failed,
                    e.pending,
                    e.success_rate * 100.0
                );
                println!("modules: {}", stats.permitted_modules.join(", "));
                println!(
                    "timeout: {}s, max output: {} chars, mode: {:?}",
                    stats.timeout_secs, stats.max_output_size, stats.execution_mode
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_experiment_action(
    cli: &Cli,
    sandbox: &Sandbox,
    action: &ExperimentAction,
) -> Result<ExitCode> {
    match action {
        ExperimentAction::Create {
            name,
            description,
            tags,
            source,
            run,
            context,
        } => {
            let code = read_code(source)?;
            let experiment = sandbox
                .create_experiment(name, &code, description, tags)
                .await?;
            if !*run {
                if cli.json {
                    emit_json(&experiment)?;
                } else {
                    print_experiment(&experiment);
                }
                return Ok(ExitCode::SUCCESS);
            }
            let context = parse_context(context.as_deref())?;
            let result = sandbox.run_experiment(&experiment.id, &context).await?;
            let experiment = sandbox
                .get_experiment(&experiment.id)
                .await
                .unwrap_or(experiment);
            if cli.json {
                emit_json(&serde_json::json!({ "experiment": experiment, "result": result }))?;
            } else {
                print_experiment(&experiment);
                print_result(&result);
            }
            Ok(exit_for(&result))
        }
        ExperimentAction::Run { id, context } => {
            let context = parse_context(context.as_deref())?;
            let result = sandbox.run_experiment(id, &context).await?;
            if cli.json {
                emit_json(&result)?;
            } else {
                print_result(&result);
            }
            Ok(exit_for(&result))
        }
        ExperimentAction::Show { id } => match sandbox.get_experiment(id).await {
            Some(experiment) => {
                if cli.json {
                    emit_json(&experiment)?;
                } else {
                    print_experiment(&experiment);
                    println!("\n{}", experiment.code);
                }
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("Experiment {id} not found");
                Ok(ExitCode::FAILURE)
            }
        },
        ExperimentAction::List { status, tag, limit } => {
            let filter = ExperimentFilter {
                status: *status,
                tag: tag.clone(),
                limit: *limit,
            };
            let experiments = sandbox.list_experiments(&filter).await;
            if cli.json {
                emit_json(&experiments)?;
            } else if experiments.is_empty() {
                println!("no experiments");
            } else {
                for experiment in &experiments {
                    println!(
                        "{}  {:<8} {}",
                        experiment.id,
                        experiment.status.to_string(),
                        experiment.name
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_sandbox_config_defaults() {
        let config =
            build_sandbox_config(&SandboxOverrides::default(), &CatalogOverrides::default())
                .unwrap();
        let default = SandboxConfig::default();
        assert_eq!(config.timeout, default.timeout);
        assert_eq!(config.max_output_size, default.max_output_size);
        assert_eq!(config.max_concurrent, default.max_concurrent);
        assert_eq!(config.execution_mode, default.execution_mode);
        assert_eq!(config.catalog, default.catalog);
    }

    #[test]
    fn build_sandbox_config_applies_overrides() {
        let overrides = SandboxOverrides {
            timeout_secs: Some(0.5),
            max_output_size: Some(200),
            execution_mode: Some("child_process".into()),
            capture_return_value: Some(false),
            ..Default::default()
        };
        let config = build_sandbox_config(&overrides, &CatalogOverrides::default()).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.max_output_size, 200);
        assert_eq!(config.execution_mode, ExecutionMode::ChildProcess);
        assert!(!config.capture_return_value);
    }

    #[test]
    fn catalog_overrides_are_applied() {
        let overrides = CatalogOverrides {
            extra_modules: vec!["heapq".into()],
            remove_modules: vec!["random".into()],
            extra_denied_patterns: vec!["ctypes".into()],
            ..Default::default()
        };
        let catalog = build_catalog(&overrides);
        assert!(catalog.permits_module("heapq"));
        assert!(!catalog.permits_module("random"));
        assert_eq!(catalog.first_denied_pattern("import CTYPES"), Some("ctypes"));
    }

    #[test]
    fn context_must_be_an_object() {
        assert!(parse_context(None).unwrap().is_empty());
        assert_eq!(parse_context(Some(r#"{"x": 1}"#)).unwrap()["x"], 1);
        assert!(parse_context(Some("[1]")).is_err());
        assert!(parse_context(Some("{")).is_err());
    }

    #[test]
    fn code_comes_from_argument_or_file() {
        let inline = CodeSource {
            code: Some("1 + 1".into()),
            path: None,
        };
        assert_eq!(read_code(&inline).unwrap(), "1 + 1");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snippet.py");
        std::fs::write(&path, "print('x')").unwrap();
        let from_disk = CodeSource {
            code: None,
            path: Some(path),
        };
        assert_eq!(read_code(&from_disk).unwrap(), "print('x')");

        let neither = CodeSource {
            code: None,
            path: None,
        };
        assert!(read_code(&neither).is_err());
    }

    #[test]
    fn cli_parses_experiment_list_filters() {
        let cli = Cli::try_parse_from([
            "crucible", "--json", "experiment", "list", "--status", "failed", "--limit", "3",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Experiment {
                action: ExperimentAction::List { status, limit, .. },
            } => {
                assert_eq!(status, Some(ExperimentStatus::Failed));
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected experiment list"),
        }
    }

    #[test]
    fn cli_parses_mode_and_timeout() {
        let cli = Cli::try_parse_from([
            "crucible", "run", "2 + 2", "--mode", "child-process", "--timeout", "0.2",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(ModeArg::ChildProcess));
        assert_eq!(cli.timeout, Some(0.2));
    }

    #[test]
    fn cli_rejects_code_and_path_together() {
        let parsed = Cli::try_parse_from(["crucible", "run", "1", "--path", "x.py"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = Path::new("/tmp/custom-crucible.toml");
        assert_eq!(find_config_file(Some(path)), Some(path.to_path_buf()));
    }

    #[test]
    fn config_file_is_loaded_with_env_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crucible.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 2\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sandbox.max_concurrent, Some(2));
    }
}
