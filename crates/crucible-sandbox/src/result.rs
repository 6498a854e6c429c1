//! The value every execution path returns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The validator refused the snippet (syntax or capability); it never ran.
    Rejected,
    /// The snippet raised while running.
    Runtime,
    /// The wall-clock deadline passed.
    Timeout,
    /// The referenced experiment does not exist.
    NotFound,
    /// The sandbox could not host the snippet (worker spawn, IPC, concurrency).
    Unavailable,
}

/// Outcome of one snippet execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the snippet ran to completion without raising.
    pub success: bool,
    /// Captured output, capped at the configured size.
    pub output: String,
    /// Diagnostic text; `None` exactly when `success` is true.
    pub error: Option<String>,
    /// Value of a trailing bare expression, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Wall-clock time of the whole call, in fractional seconds on the wire.
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    /// Non-fatal validator observations.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Failure class; `None` on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
}

impl ExecutionResult {
    /// A completed run.
    pub fn completed(output: String, return_value: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            return_value,
            execution_time: Duration::ZERO,
            warnings: Vec::new(),
            fault: None,
        }
    }

    /// A failed run of class `fault`.
    pub fn failed(fault: FaultKind, error: impl Into<String>, output: String) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
            return_value: None,
            execution_time: Duration::ZERO,
            warnings: Vec::new(),
            fault: Some(fault),
        }
    }

    /// A snippet the validator refused. Its execution time is zero.
    pub fn rejected(issues: &[String]) -> Self {
        Self::failed(
            FaultKind::Rejected,
            format!("Validation failed: {}", issues.join("; ")),
            String::new(),
        )
    }

    /// A run that exceeded `timeout`.
    pub fn timed_out(timeout: Duration, output: String) -> Self {
        Self::failed(
            FaultKind::Timeout,
            format!("execution timed out after {}", format_duration(timeout)),
            output,
        )
    }

    /// A lookup of an unknown experiment.
    pub fn not_found(id: &str) -> Self {
        Self::failed(
            FaultKind::NotFound,
            format!("Experiment {id} not found"),
            String::new(),
        )
    }

    /// Whether this result is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.fault == Some(FaultKind::Timeout)
    }
}

/// Render a duration the way timeout messages show it: `250ms`, `5s`, `1.5s`.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}s", d.as_secs_f64())
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_joins_issues() {
        let result = ExecutionResult::rejected(&["a".into(), "b".into()]);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Validation failed: a; b"));
        assert_eq!(result.execution_time, Duration::ZERO);
        assert_eq!(result.fault, Some(FaultKind::Rejected));
    }

    #[test]
    fn timeout_message_names_the_deadline() {
        let result = ExecutionResult::timed_out(Duration::from_millis(200), "partial".into());
        assert_eq!(
            result.error.as_deref(),
            Some("execution timed out after 200ms")
        );
        assert_eq!(result.output, "partial");
        assert!(result.is_timeout());
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    }

    #[test]
    fn execution_time_serializes_as_seconds() {
        let mut result = ExecutionResult::completed("hi\n".into(), Some(serde_json::json!(4)));
        result.execution_time = Duration::from_millis(250);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["execution_time"], serde_json::json!(0.25));
        assert!(json.get("fault").is_none());
        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
