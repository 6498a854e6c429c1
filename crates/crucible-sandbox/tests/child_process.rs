//! Integration tests for child-process execution mode.
//!
//! These tests verify that `ExecutionMode::ChildProcess` correctly:
//! - spawns an isolated worker and returns its result
//! - kills runaway snippets at the deadline
//! - reports a missing worker as a data result
//!
//! All tests are serialized to avoid contention between worker processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crucible_sandbox::{ExecutionMode, FaultKind, Sandbox, SandboxConfig, SandboxExecutor};
use serde_json::{json, Map};
use serial_test::serial;

fn child_process_config() -> SandboxConfig {
    SandboxConfig {
        execution_mode: ExecutionMode::ChildProcess,
        worker_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_crucible-worker"))),
        timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[tokio::test]
#[serial]
async fn child_process_simple_execution() {
    let exec = SandboxExecutor::new(child_process_config());
    let result = exec
        .execute("import math\nprint('root', math.isqrt(81))\n{'answer': 42}", &Map::new())
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, "root 9\n");
    assert_eq!(result.return_value, Some(json!({"answer": 42})));
}

#[tokio::test]
#[serial]
async fn child_process_receives_context() {
    let exec = SandboxExecutor::new(child_process_config());
    let context = json!({"name": "crucible", "n": 3});
    let result = exec
        .execute("name * n", context.as_object().unwrap())
        .await;
    assert_eq!(result.return_value, Some(json!("cruciblecruciblecrucible")));
}

#[tokio::test]
#[serial]
async fn child_process_runtime_error_is_reported() {
    let exec = SandboxExecutor::new(child_process_config());
    let result = exec
        .execute("print('partial')\nint('nope')", &Map::new())
        .await;
    assert_eq!(result.fault, Some(FaultKind::Runtime));
    assert_eq!(result.output, "partial\n");
    assert!(result.error.unwrap().contains("ValueError"));
}

#[tokio::test]
#[serial]
async fn child_process_rejects_before_spawning() {
    let config = SandboxConfig {
        worker_binary: Some(PathBuf::from("/nonexistent/crucible-worker")),
        ..child_process_config()
    };
    let result = SandboxExecutor::new(config)
        .execute("import socket", &Map::new())
        .await;
    assert_eq!(result.fault, Some(FaultKind::Rejected));
}

#[tokio::test]
#[serial]
async fn child_process_timeout_kills_the_loop() {
    let exec = SandboxExecutor::new(child_process_config());
    let start = Instant::now();
    let result = exec
        .execute_with_timeout(
            "print('spinning')\nwhile True:\n    pass",
            &Map::new(),
            Duration::from_millis(500),
        )
        .await;
    assert!(result.is_timeout(), "{result:?}");
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(
        result.error.as_deref(),
        Some("execution timed out after 500ms")
    );
}

#[tokio::test]
#[serial]
async fn missing_worker_is_unavailable() {
    let config = SandboxConfig {
        worker_binary: Some(PathBuf::from("/nonexistent/crucible-worker")),
        ..child_process_config()
    };
    let result = SandboxExecutor::new(config).execute("1", &Map::new()).await;
    assert_eq!(result.fault, Some(FaultKind::Unavailable));
    assert!(result.error.unwrap().contains("does not exist"));
}

#[tokio::test]
#[serial]
async fn child_process_experiments_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Sandbox::open(dir.path(), child_process_config()).await.unwrap();
    let (experiment, result) = sandbox
        .create_and_run("sorted", "sorted([3, 1, 2])", "", &Map::new())
        .await
        .unwrap();
    assert_eq!(result.return_value, Some(json!([1, 2, 3])));
    assert!(experiment.result.unwrap().success);
}
