//! Crucible worker: isolated child process for one snippet execution.
//!
//! Spawned by [`crucible_sandbox::host::SandboxHost`]. Reads a single
//! `Execute` message from stdin, runs the snippet with the in-process
//! executor, writes one reply to stdout and exits. Exiting is what reclaims a
//! snippet that ignored its deadline.
//!
//! The parent starts this process with a cleared environment.

use std::time::Duration;

use anyhow::{Context, Result};
use crucible_sandbox::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage};
use crucible_sandbox::{SandboxExecutor, DEFAULT_MAX_IPC_MESSAGE_SIZE};
use tokio::io::{self, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdout = io::stdout();
    let reply = match run().await {
        Ok(result) => ChildMessage::ExecutionComplete { result },
        Err(e) => ChildMessage::Fault {
            message: format!("{e:#}"),
        },
    };
    if let Err(e) = write_message(&mut stdout, &reply).await {
        tracing::error!(error = %e, "failed to send reply to parent");
        std::process::exit(1);
    }
    // A timed-out snippet thread may still be running; leave without joining it.
    std::process::exit(0);
}

async fn run() -> Result<crucible_sandbox::ExecutionResult> {
    let mut stdin = BufReader::new(io::stdin());
    let msg: ParentMessage = read_message_with_limit(&mut stdin, DEFAULT_MAX_IPC_MESSAGE_SIZE)
        .await
        .context("failed to read Execute message from parent")?
        .context("parent closed stdin before sending Execute")?;

    let ParentMessage::Execute {
        code,
        context,
        config,
    } = msg;

    let timeout = Duration::from_millis(config.timeout_ms);
    let executor = SandboxExecutor::new(config.to_sandbox_config());
    Ok(executor.execute_with_timeout(&code, &context, timeout).await)
}
