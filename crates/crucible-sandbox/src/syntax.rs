//! Snippet parsing and lowering.
//!
//! Snippets are parsed by the embedded interpreter's own `ast` module, so the
//! validator sees exactly the grammar the runtime will execute. The resulting
//! tree is immediately lowered into [`SyntaxNode`], a closed set of the node
//! kinds that matter for capability checks. Everything else in the tree is
//! dropped during lowering.

use std::iter::Peekable;
use std::str::Chars;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;

/// Maximum bracket nesting accepted before the interpreter's parser is invoked.
pub const MAX_NESTING_DEPTH: usize = 256;

/// A safety-relevant node of a snippet's syntax tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxNode {
    /// `import a.b` (one node per alias).
    Import {
        /// Dotted module path.
        module: String,
    },
    /// `from a.b import c` or `from . import c`.
    ImportFrom {
        /// Dotted module path, absent for `from . import x`.
        module: Option<String>,
        /// Number of leading dots.
        level: u32,
    },
    /// A call expression.
    Call {
        /// Callee name when the call target is a bare name.
        callee: Option<String>,
    },
    /// `expr.attr`, in any context (load, store, delete).
    Attribute {
        /// Attribute name.
        attr: String,
    },
    /// A bare identifier reference.
    Name {
        /// Identifier.
        id: String,
    },
}

/// Lowered view of a parsed snippet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntaxTree {
    /// Safety-relevant nodes in breadth-first order.
    pub nodes: Vec<SyntaxNode>,
    /// Whether the last top-level statement is a bare expression.
    pub trailing_expression: bool,
}

/// Why a snippet could not be turned into a [`SyntaxTree`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    /// Bracket nesting exceeded [`MAX_NESTING_DEPTH`].
    #[error("nesting depth {actual} exceeds maximum of {max}")]
    NestingTooDeep {
        /// Configured maximum.
        max: usize,
        /// Depth found.
        actual: usize,
    },
    /// The parser rejected the snippet.
    #[error("{message}")]
    Syntax {
        /// Parser message.
        message: String,
        /// 1-based line of the error, when reported.
        line: Option<u32>,
    },
    /// The tree could not be inspected.
    #[error("{0}")]
    Analysis(String),
}

/// Pre-scan bracket nesting so pathological input never reaches the parser.
///
/// Brackets inside string literals and comments are not counted.
pub fn check_nesting_depth(code: &str) -> Result<(), ParseFailure> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    let mut chars = code.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '\'' | '"' => skip_string_literal(&mut chars, ch),
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(ParseFailure::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
            actual: max_depth,
        });
    }
    Ok(())
}

/// Consume a literal whose opening `quote` was just read. An unterminated
/// single-quoted literal ends at the line break; the parser reports it.
fn skip_string_literal(chars: &mut Peekable<Chars<'_>>, quote: char) {
    let triple = if chars.peek() == Some(&quote) {
        chars.next();
        if chars.peek() != Some(&quote) {
            return;
        }
        chars.next();
        true
    } else {
        false
    };
    let mut closing = 0;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
                closing = 0;
            }
            c if c == quote => {
                closing += 1;
                if !triple || closing == 3 {
                    return;
                }
            }
            '\n' if !triple => return,
            _ => closing = 0,
        }
    }
}

/// Parse `code` and lower it.
pub fn parse(code: &str) -> Result<SyntaxTree, ParseFailure> {
    check_nesting_depth(code)?;
    Python::with_gil(|py| {
        let ast = py
            .import_bound("ast")
            .map_err(|e| ParseFailure::Analysis(e.to_string()))?;
        let tree = ast
            .call_method1("parse", (code, "<sandbox>", "exec"))
            .map_err(|e| syntax_failure(py, e))?;
        lower(&ast, &tree).map_err(|e| ParseFailure::Analysis(e.to_string()))
    })
}

fn syntax_failure(py: Python<'_>, err: PyErr) -> ParseFailure {
    if !err.is_instance_of::<PySyntaxError>(py) {
        return ParseFailure::Syntax {
            message: err.to_string(),
            line: None,
        };
    }
    let value = err.value_bound(py);
    let message = value
        .getattr("msg")
        .and_then(|m| m.extract::<String>())
        .unwrap_or_else(|_| err.to_string());
    let line = value
        .getattr("lineno")
        .and_then(|l| l.extract::<Option<u32>>())
        .unwrap_or(None);
    ParseFailure::Syntax { message, line }
}

fn lower(ast: &Bound<'_, PyModule>, tree: &Bound<'_, PyAny>) -> PyResult<SyntaxTree> {
    let body = tree.getattr("body")?;
    let trailing_expression = match body.len()? {
        0 => false,
        n => kind(&body.get_item(n - 1)?)? == "Expr",
    };

    let mut nodes = Vec::new();
    for node in ast.call_method1("walk", (tree,))?.iter()? {
        let node = node?;
        match kind(&node)?.as_str() {
            "Import" => {
                for alias in node.getattr("names")?.iter()? {
                    nodes.push(SyntaxNode::Import {
                        module: alias?.getattr("name")?.extract()?,
                    });
                }
            }
            "ImportFrom" => nodes.push(SyntaxNode::ImportFrom {
                module: node.getattr("module")?.extract()?,
                level: node
                    .getattr("level")?
                    .extract::<Option<u32>>()?
                    .unwrap_or(0),
            }),
            "Call" => {
                let func = node.getattr("func")?;
                let callee = if kind(&func)? == "Name" {
                    Some(func.getattr("id")?.extract()?)
                } else {
                    None
                };
                nodes.push(SyntaxNode::Call { callee });
            }
            "Attribute" => nodes.push(SyntaxNode::Attribute {
                attr: node.getattr("attr")?.extract()?,
            }),
            "Name" => nodes.push(SyntaxNode::Name {
                id: node.getattr("id")?.extract()?,
            }),
            _ => {}
        }
    }

    Ok(SyntaxTree {
        nodes,
        trailing_expression,
    })
}

fn kind(node: &Bound<'_, PyAny>) -> PyResult<String> {
    Ok(node.get_type().name()?.to_string())
}
