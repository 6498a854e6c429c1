//! IPC protocol between the parent and a `crucible-worker` child.
//!
//! Length-delimited JSON: a 4-byte big-endian length prefix followed by the
//! payload. The parent sends exactly one [`ParentMessage::Execute`]; the
//! child answers with exactly one [`ChildMessage`] and exits.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::catalog::CapabilityCatalog;
use crate::executor::{ExecutionMode, SandboxConfig};
use crate::result::ExecutionResult;

/// Default cap on a single framed message (8 MiB).
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Messages sent from the parent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Run this snippet.
    Execute {
        /// Snippet source.
        code: String,
        /// Caller-supplied bindings.
        context: Map<String, Value>,
        /// Limits and policy for this run.
        config: WorkerConfig,
    },
}

/// Messages sent from the worker to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The snippet finished, failed or timed out inside the worker.
    ExecutionComplete {
        /// Full result, output included.
        result: ExecutionResult,
    },
    /// The worker could not host the snippet at all.
    Fault {
        /// What went wrong.
        message: String,
    },
}

/// Settings forwarded to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Deadline the worker enforces on itself.
    pub timeout_ms: u64,
    /// Output cap in characters.
    pub max_output_size: usize,
    /// Code size cap in bytes.
    pub max_code_size: usize,
    /// Whether to evaluate a trailing expression.
    pub capture_return_value: bool,
    /// Capability policy.
    pub catalog: CapabilityCatalog,
    /// Maximum IPC message size in bytes.
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl WorkerConfig {
    /// Forward `config`, with `timeout` as the deadline for this run.
    pub fn new(config: &SandboxConfig, timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            max_output_size: config.max_output_size,
            max_code_size: config.max_code_size,
            capture_return_value: config.capture_return_value,
            catalog: config.catalog.as_ref().clone(),
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }

    /// The in-process configuration the worker runs the snippet with.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_output_size: self.max_output_size,
            max_code_size: self.max_code_size,
            max_concurrent: 1,
            execution_mode: ExecutionMode::InProcess,
            capture_return_value: self.capture_return_value,
            catalog: Arc::new(self.catalog.clone()),
            worker_binary: None,
            max_ipc_message_size: self.max_ipc_message_size,
        }
    }
}

/// Write one framed message.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC payload too large: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message using [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read one framed message, rejecting payloads larger than `max_size`.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let msg = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn execute_message_survives_framing() {
        let msg = ParentMessage::Execute {
            code: "x + 1".into(),
            context: json!({"x": 1}).as_object().cloned().unwrap(),
            config: WorkerConfig::new(&SandboxConfig::default(), Duration::from_millis(750)),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Option<ParentMessage> = read_message(&mut cursor).await.unwrap();
        let ParentMessage::Execute {
            code,
            context,
            config,
        } = decoded.unwrap();
        assert_eq!(code, "x + 1");
        assert_eq!(context["x"], json!(1));
        assert_eq!(config.timeout_ms, 750);
        assert_eq!(config.catalog, CapabilityCatalog::default());
    }

    #[tokio::test]
    async fn message_is_tagged_by_type() {
        let msg = ChildMessage::Fault {
            message: "boom".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "Fault");
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let msg: Option<ChildMessage> = read_message(&mut cursor).await.unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut frame = (1024u32).to_be_bytes().to_vec();
        frame.extend(vec![b' '; 1024]);
        let mut cursor = Cursor::new(frame);
        let err = read_message_with_limit::<ChildMessage, _>(&mut cursor, 100)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut frame = (50u32).to_be_bytes().to_vec();
        frame.extend_from_slice(b"{\"type\":");
        let mut cursor = Cursor::new(frame);
        assert!(read_message::<ChildMessage, _>(&mut cursor).await.is_err());
    }

    #[test]
    fn worker_config_runs_in_process() {
        let config = WorkerConfig::new(&SandboxConfig::default(), Duration::from_secs(1));
        let local = config.to_sandbox_config();
        assert_eq!(local.execution_mode, ExecutionMode::InProcess);
        assert_eq!(local.timeout, Duration::from_secs(1));
    }
}
