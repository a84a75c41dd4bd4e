//! Secret redaction for text that is about to be logged or persisted
//!
//! Matches are replaced with [`REDACTION_MARKER`]. When a pattern has a
//! `secret` capture group only that group is replaced, so `password=hunter2`
//! becomes `password=[REDACTED]`. Text outside matches is never touched.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

/// Replacement for every redacted secret
pub const REDACTION_MARKER: &str = "[REDACTED]";

const SHARED_PATTERNS: &[&str] = &[
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
    r"(?i)\bbearer\s+(?P<secret>[A-Za-z0-9\-._~+/]{8,}=*)",
    r"(?i)\bauthorization:\s*(?:basic|token)\s+(?P<secret>\S+)",
    r"\bsk-[A-Za-z0-9_\-]{16,}",
    r"\bAKIA[0-9A-Z]{16}\b",
    r"\bgh[pousr]_[A-Za-z0-9]{20,}",
    r"\bgithub_pat_[A-Za-z0-9_]{20,}",
    r"\bglpat-[A-Za-z0-9_\-]{20,}",
    r"\bxox[abprs]-[A-Za-z0-9\-]{10,}",
    r"\bAIza[0-9A-Za-z_\-]{35}",
    r#"(?i)\b[a-z0-9_\-]*?(?:password|passwd|pwd|secret|token|api[_\-]?key|access[_\-]?key|private[_\-]?key|auth)\b["']?\s*[:=]\s*(?P<secret>"[^"\r\n]*"|'[^'\r\n]*'|[^\s"',;&]+)"#,
    r"(?i)\b[a-z][a-z0-9+.\-]*://[^/\s:@]+:(?P<secret>[^@\s/]+)@",
];

static SHARED_RULES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| SHARED_PATTERNS.iter().filter_map(|p| Regex::new(p).ok()).collect());

/// Redacts secrets using the shared patterns plus any literal secrets the
/// owning adapter knows about (for example values of its own API key
/// environment variables)
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    literals: Vec<Regex>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also redact these exact strings wherever they appear
    pub fn with_literals<I, S>(mut self, literals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for literal in literals {
            let literal = literal.as_ref();
            // very short values would redact ordinary words
            if literal.len() < 6 {
                debug!("Redactor::with_literals: skipping short literal");
                continue;
            }
            if let Ok(regex) = Regex::new(&regex::escape(literal)) {
                self.literals.push(regex);
            }
        }
        self
    }

    /// Replace every secret in `text` with the redaction marker
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for regex in self.literals.iter().chain(SHARED_RULES.iter()) {
            let replaced = match regex.replace_all(&out, replace_match) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = replaced {
                out = Cow::Owned(s);
            }
        }
        out
    }
}

fn replace_match(caps: &Captures<'_>) -> String {
    let Some(whole) = caps.get(0) else {
        return String::new();
    };
    match caps.name("secret") {
        Some(secret) => {
            let text = whole.as_str();
            let start = secret.start() - whole.start();
            let end = secret.end() - whole.start();
            format!("{}{}{}", &text[..start], REDACTION_MARKER, &text[end..])
        }
        None => REDACTION_MARKER.to_string(),
    }
}

/// Redact with the shared patterns only
pub fn redact_secrets(text: &str) -> String {
    Redactor::new().redact(text).into_owned()
}
