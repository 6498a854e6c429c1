//! Aggregate report over stored experiments.
//!
//! Purely advisory: nothing here feeds back into validation or execution.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::experiment::{Experiment, ExperimentStats, ExperimentStatus};

static LOOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:async\s+)?(?:for|while)\b").unwrap());

static FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:async\s+)?def\s+\w+").unwrap());

/// Categories reported in [`AnalysisReport::common_errors`].
const MAX_ERROR_CATEGORIES: usize = 5;

/// Finished experiments needed before the failure-rate warning fires.
const MIN_FINISHED_FOR_WARNING: usize = 3;

/// How often one error category occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCategory {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub total: usize,
    /// Same definition as [`ExperimentStats::success_rate`].
    pub success_rate: f64,
    /// Most frequent first, ties broken by name.
    pub common_errors: Vec<ErrorCategory>,
    pub insights: Vec<String>,
}

/// Build the report for `experiments`.
pub fn analyze(experiments: &[Experiment]) -> AnalysisReport {
    let stats = ExperimentStats::from_experiments(experiments);
    let finished: Vec<&Experiment> = experiments
        .iter()
        .filter(|e| e.status.is_finished())
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for experiment in &finished {
        if experiment.status != ExperimentStatus::Failed {
            continue;
        }
        if let Some(error) = experiment.result.as_ref().and_then(|r| r.error.as_deref()) {
            *counts.entry(error_category(error)).or_default() += 1;
        }
    }
    let mut common_errors: Vec<ErrorCategory> = counts
        .into_iter()
        .map(|(category, count)| ErrorCategory { category, count })
        .collect();
    common_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    common_errors.truncate(MAX_ERROR_CATEGORIES);

    let mut insights = Vec::new();

    let (with_loops, without_loops): (Vec<&Experiment>, Vec<&Experiment>) =
        finished.iter().copied().partition(|e| LOOP_RE.is_match(&e.code));
    if let (Some(looped), Some(plain)) = (rate(&with_loops), rate(&without_loops)) {
        let comparison = if looped > plain {
            "more"
        } else if looped < plain {
            "less"
        } else {
            "as"
        };
        let tail = if comparison == "as" { "often as" } else { "often than" };
        insights.push(format!(
            "Experiments with loops succeed {comparison} {tail} those without ({:.0}% vs {:.0}%)",
            looped * 100.0,
            plain * 100.0
        ));
    }

    let with_functions = finished
        .iter()
        .filter(|e| e.status == ExperimentStatus::Success && FUNCTION_RE.is_match(&e.code))
        .count();
    if with_functions > 0 {
        insights.push(format!(
            "Function definitions appear in {with_functions} successful experiment{}",
            if with_functions == 1 { "" } else { "s" }
        ));
    }

    if finished.len() >= MIN_FINISHED_FOR_WARNING {
        let failure_rate = stats.failed as f64 / finished.len() as f64;
        if failure_rate > 0.5 {
            insights.push(format!(
                "{:.0}% of finished experiments failed; prefer simpler code patterns",
                failure_rate * 100.0
            ));
        }
    }

    AnalysisReport {
        total: stats.total,
        success_rate: stats.success_rate,
        common_errors,
        insights,
    }
}

/// The part of `error` before its first `:`, on the line naming the fault.
///
/// For a traceback that is the final exception line, so
/// `Traceback ...\nValueError: x` categorizes as `ValueError`.
pub fn error_category(error: &str) -> String {
    let line = if error.starts_with("Traceback") {
        error
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty() && !l.starts_with(' '))
            .unwrap_or(error)
    } else {
        error.lines().next().unwrap_or(error)
    };
    match line.split_once(':') {
        Some((head, _)) if !head.trim().is_empty() => head.trim().to_string(),
        _ => "Unknown".to_string(),
    }
}

fn rate(experiments: &[&Experiment]) -> Option<f64> {
    if experiments.is_empty() {
        return None;
    }
    let ok = experiments
        .iter()
        .filter(|e| e.status == ExperimentStatus::Success)
        .count();
    Some(ok as f64 / experiments.len() as f64)
}
