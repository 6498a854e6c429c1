//! Pre-execution validator.
//!
//! Runs four gates in order and stops at the first one that rejects:
//! size, parse, denylisted substrings, then a structural walk over the
//! lowered syntax tree. The substring gate is coarse on purpose and is never
//! a substitute for the walk; both always run on accepted code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::CapabilityCatalog;
use crate::syntax::{self, ParseFailure, SyntaxNode, SyntaxTree};

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Verdict of [`Validator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the snippet may run.
    pub is_safe: bool,
    /// Violations when rejected, warnings when accepted.
    pub issues: Vec<String>,
    /// Whether the last top-level statement is a bare expression.
    #[serde(default)]
    pub has_trailing_expression: bool,
}

impl ValidationOutcome {
    pub(crate) fn rejected(issues: Vec<String>) -> Self {
        Self {
            is_safe: false,
            issues,
            has_trailing_expression: false,
        }
    }
}

/// Static capability checker.
#[derive(Debug, Clone)]
pub struct Validator {
    catalog: Arc<CapabilityCatalog>,
    max_code_size: usize,
}

impl Validator {
    /// Create a validator enforcing `catalog`.
    pub fn new(catalog: Arc<CapabilityCatalog>) -> Self {
        Self {
            catalog,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
        }
    }

    /// Override the maximum accepted code size in bytes.
    pub fn with_max_code_size(mut self, max: usize) -> Self {
        self.max_code_size = max;
        self
    }

    /// The policy this validator enforces.
    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    /// Decide whether `code` may run.
    pub fn validate(&self, code: &str) -> ValidationOutcome {
        if code.len() > self.max_code_size {
            return ValidationOutcome::rejected(vec![format!(
                "Code too large: {} bytes (max {})",
                code.len(),
                self.max_code_size
            )]);
        }

        let tree = match syntax::parse(code) {
            Ok(tree) => tree,
            Err(failure) => return ValidationOutcome::rejected(vec![describe(&failure)]),
        };

        if let Some(pattern) = self.catalog.first_denied_pattern(code) {
            return ValidationOutcome::rejected(vec![format!(
                "Blocked: contains dangerous pattern '{pattern}'"
            )]);
        }

        let walk = self.walk(&tree);
        if !walk.violations.is_empty() {
            return ValidationOutcome::rejected(walk.violations);
        }

        ValidationOutcome {
            is_safe: true,
            issues: walk.warnings,
            has_trailing_expression: tree.trailing_expression,
        }
    }

    fn walk(&self, tree: &SyntaxTree) -> Walk {
        let mut walk = Walk::default();
        for node in &tree.nodes {
            match node {
                SyntaxNode::Import { module } => {
                    if !self.catalog.permits_module(module) {
                        walk.violation(format!("Import blocked: {module}"));
                    }
                }
                SyntaxNode::ImportFrom { module, level } => match module {
                    _ if *level > 0 => walk.violation(format!(
                        "Import blocked: relative import from {}{}",
                        ".".repeat(*level as usize),
                        module.as_deref().unwrap_or("")
                    )),
                    Some(module) if !self.catalog.permits_module(module) => {
                        walk.violation(format!("Import blocked: from {module}"))
                    }
                    Some(_) => {}
                    None => walk.violation("Import blocked: from <unnamed module>".into()),
                },
                SyntaxNode::Call { callee } => {
                    if let Some(name) = callee {
                        if self.catalog.is_dangerous_call(name) {
                            walk.violation(format!("Dangerous function: {name}"));
                        }
                    }
                }
                SyntaxNode::Attribute { attr } => {
                    if self.catalog.is_blocked_attribute(attr) {
                        walk.violation(format!("Blocked attribute access: {attr}"));
                    } else if is_dunder(attr) && !self.catalog.is_benign_dunder(attr) {
                        walk.warning(format!("Suspicious attribute access: {attr}"));
                    }
                }
                SyntaxNode::Name { id } => {
                    if is_dunder(id)
                        && !self.catalog.is_benign_dunder(id)
                        && !self.catalog.permits_builtin(id)
                    {
                        walk.violation(format!("Blocked name: {id}"));
                    }
                }
            }
        }
        walk
    }
}

#[derive(Default)]
struct Walk {
    violations: Vec<String>,
    warnings: Vec<String>,
}

impl Walk {
    fn violation(&mut self, message: String) {
        if !self.violations.contains(&message) {
            self.violations.push(message);
        }
    }

    fn warning(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn describe(failure: &ParseFailure) -> String {
    match failure {
        ParseFailure::Syntax {
            message,
            line: Some(line),
        } => format!("Syntax error: {message} (line {line})"),
        ParseFailure::Syntax { message, line: None } => format!("Syntax error: {message}"),
        ParseFailure::NestingTooDeep { .. } => format!("Syntax error: {failure}"),
        ParseFailure::Analysis(message) => format!("Analysis error: {message}"),
    }
}
