//! Bounded capture of snippet output.

use std::sync::{Arc, Mutex};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

/// Default cap on captured output, in characters.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 10_000;

/// Append-only text buffer that stops growing at a fixed character count.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    /// Create a buffer holding at most `limit` characters.
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            truncated: false,
        }
    }

    /// Append `s`, dropping whatever does not fit.
    pub fn push(&mut self, s: &str) {
        if self.chars >= self.limit {
            if !s.is_empty() {
                self.truncated = true;
            }
            return;
        }
        let room = self.limit - self.chars;
        let taken = s.chars().take(room).count();
        let end = s
            .char_indices()
            .nth(taken)
            .map(|(idx, _)| idx)
            .unwrap_or(s.len());
        self.text.push_str(&s[..end]);
        self.chars += taken;
        if end < s.len() {
            self.truncated = true;
        }
    }

    /// Captured text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of characters captured.
    pub fn len(&self) -> usize {
        self.chars
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Whether any output was dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Shared handle to an [`OutputBuffer`], readable while the snippet still runs.
pub type SharedOutput = Arc<Mutex<OutputBuffer>>;

/// Snapshot the buffer's text.
pub fn snapshot(output: &SharedOutput) -> String {
    output
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .as_str()
        .to_string()
}

/// The `print` a snippet sees. Writes into the shared buffer; `file` and
/// `flush` are accepted and ignored.
#[pyclass(module = "crucible", name = "print")]
pub(crate) struct CapturedPrint {
    output: SharedOutput,
}

impl CapturedPrint {
    pub(crate) fn new(output: SharedOutput) -> Self {
        Self { output }
    }
}

#[pymethods]
impl CapturedPrint {
    #[pyo3(signature = (*args, sep = None, end = None, **_kwargs))]
    fn __call__(
        &self,
        args: &Bound<'_, PyTuple>,
        sep: Option<String>,
        end: Option<String>,
        _kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<()> {
        let sep = sep.unwrap_or_else(|| " ".to_string());
        let mut line = String::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                line.push_str(&sep);
            }
            line.push_str(&arg.str()?.to_string());
        }
        line.push_str(end.as_deref().unwrap_or("\n"));
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(&line);
        Ok(())
    }
}
