//! Error types for the Crucible sandbox.
//!
//! Rejected snippets, runtime faults, timeouts and unknown experiment ids are
//! not errors: they come back as [`ExecutionResult`](crate::ExecutionResult)
//! or [`ValidationOutcome`](crate::ValidationOutcome) values. The variants
//! below cover infrastructure that failed underneath a snippet.

use std::path::PathBuf;

use thiserror::Error;

/// Infrastructure failures surfaced by the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Reading or writing the experiment directory failed.
    #[error("storage I/O failed at {path}: {source}")]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The experiment index exists but could not be decoded.
    #[error("experiment index {path} is corrupt: {source}")]
    CorruptIndex {
        /// Path of the index file.
        path: PathBuf,
        /// Decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// Serializing a record failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The worker process could not be located, spawned or talked to.
    #[error("worker process failed: {message}")]
    Worker {
        /// What went wrong.
        message: String,
    },

    /// A framed IPC message violated the protocol.
    #[error("ipc error: {0}")]
    Ipc(String),
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn worker(message: impl Into<String>) -> Self {
        SandboxError::Worker {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn io_error_names_the_path_and_keeps_its_source() {
        let err = SandboxError::io(
            "/tmp/store/experiments.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(
            err.to_string(),
            "storage I/O failed at /tmp/store/experiments.json: denied"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn worker_and_ipc_errors_render_their_message() {
        assert_eq!(
            SandboxError::worker("binary not found").to_string(),
            "worker process failed: binary not found"
        );
        assert_eq!(
            SandboxError::Ipc("frame too large".into()).to_string(),
            "ipc error: frame too large"
        );
    }

    #[test]
    fn serde_errors_convert_with_question_mark() {
        fn decode(bytes: &[u8]) -> Result<serde_json::Value, SandboxError> {
            Ok(serde_json::from_slice(bytes)?)
        }
        let err = decode(b"{oops").unwrap_err();
        assert!(matches!(err, SandboxError::Serialization(_)), "{err}");
    }
}
