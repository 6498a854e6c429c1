//! Credential scrubbing for audit records.
//!
//! Snippets sometimes carry API keys or tokens pasted in by whoever wrote
//! them. Audit previews and audit error messages pass through
//! [`redact_secrets`] so those values never reach a log sink.

use std::sync::LazyLock;

use regex::Regex;

static PEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----")
        .unwrap()
});

static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

/// AWS access key ids.
static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").unwrap());

static GITHUB_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:ghp_|gho_|ghs_|ghr_|github_pat_)[a-zA-Z0-9_]{20,}").unwrap());

/// `key = value` style assignments of well-known secret names, quoted or not.
static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(api_key|apikey|token|password|passwd|secret)(\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#,
    )
    .unwrap()
});

static BEARER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)Bearer\s+\S+").unwrap());

/// Replace credential-looking substrings with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    let mut out = PEM_KEY_RE.replace_all(text, "[REDACTED]").into_owned();
    out = JWT_RE.replace_all(&out, "[REDACTED]").into_owned();
    out = AWS_KEY_RE.replace_all(&out, "[REDACTED]").into_owned();
    out = GITHUB_TOKEN_RE.replace_all(&out, "[REDACTED]").into_owned();
    out = BEARER_RE.replace_all(&out, "Bearer [REDACTED]").into_owned();
    out = ASSIGNMENT_RE
        .replace_all(&out, "${1}${2}[REDACTED]")
        .into_owned();
    out
}
