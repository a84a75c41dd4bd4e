//! Pattern-based error classification
//!
//! Each adapter may declare its own ordered `(pattern, kind)` list. Those are
//! checked first; anything they do not match falls through to the shared
//! taxonomy below, which is checked in retry-priority order. Text that matches
//! nothing is `permanent`.

use std::sync::LazyLock;

use eyre::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorKind;

/// Provider-specific pattern as written in config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub kind: ErrorKind,
    pub regex: String,
}

/// A compiled `(pattern, kind)` pair
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub regex: Regex,
    pub kind: ErrorKind,
}

impl PatternRule {
    pub fn new(pattern: &str, kind: ErrorKind) -> Result<Self> {
        let regex = Regex::new(pattern).context(format!("Invalid error pattern: {}", pattern))?;
        Ok(Self { regex, kind })
    }
}

const SHARED_PATTERNS: &[(ErrorKind, &str)] = &[
    (ErrorKind::RateLimited, r"(?i)rate[ _-]?limit"),
    (ErrorKind::RateLimited, r"(?i)too many requests"),
    (ErrorKind::RateLimited, r"\b429\b"),
    (ErrorKind::RateLimited, r"(?i)usage limit (reached|exceeded)"),
    (ErrorKind::RateLimited, r"(?i)limit (will )?resets?\b"),
    (ErrorKind::AuthExpired, r"(?i)\b(token|session|credentials?|login|api key)\b.{0,20}\bexpired"),
    (ErrorKind::AuthExpired, r"(?i)\bunauthori[sz]ed\b"),
    (ErrorKind::AuthExpired, r"\b401\b"),
    (ErrorKind::AuthExpired, r"(?i)invalid (api[ _-]?key|token|credentials|x-api-key)"),
    (ErrorKind::AuthExpired, r"(?i)authentication (failed|required|error)"),
    (ErrorKind::AuthExpired, r"(?i)please (log ?in|re-?authenticate|run .{0,20}login)"),
    (ErrorKind::QuotaExceeded, r"(?i)\bquota\b"),
    (ErrorKind::QuotaExceeded, r"(?i)insufficient[ _](credits?|balance|funds)"),
    (ErrorKind::QuotaExceeded, r"(?i)credit balance is too low"),
    (ErrorKind::QuotaExceeded, r"(?i)billing"),
    (ErrorKind::QuotaExceeded, r"\b402\b"),
    (ErrorKind::Transient, r"(?i)timed? ?out"),
    (ErrorKind::Transient, r"(?i)connection (reset|refused|closed|aborted)"),
    (ErrorKind::Transient, r"(?i)temporar(y|ily)"),
    (ErrorKind::Transient, r"(?i)service unavailable"),
    (ErrorKind::Transient, r"(?i)\boverloaded"),
    (ErrorKind::Transient, r"(?i)internal server error"),
    (ErrorKind::Transient, r"(?i)bad gateway"),
    (ErrorKind::Transient, r"\b50[0234]\b"),
    (ErrorKind::Transient, r"(?i)\b(econnreset|etimedout|econnrefused|eai_again)\b"),
    (ErrorKind::Transient, r"(?i)broken pipe"),
    (ErrorKind::Transient, r"(?i)network (error|is unreachable)"),
    (ErrorKind::Permanent, r"(?i)invalid (request|argument)"),
    (ErrorKind::Permanent, r"(?i)\b(400|404)\b"),
];

static SHARED_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    SHARED_PATTERNS
        .iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|regex| PatternRule { regex, kind: *kind }))
        .collect()
});

/// Classify text against the shared taxonomy only
pub fn classify_shared(message: &str) -> ErrorKind {
    for rule in SHARED_RULES.iter() {
        if rule.regex.is_match(message) {
            return rule.kind;
        }
    }
    ErrorKind::Permanent
}

/// Ordered provider patterns plus the shared fallback
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    rules: Vec<PatternRule>,
}

impl ErrorClassifier {
    /// Classifier with only the shared taxonomy
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier with provider-specific rules checked first, in order
    pub fn with_rules(rules: Vec<PatternRule>) -> Self {
        debug!(rule_count = rules.len(), "ErrorClassifier::with_rules: called");
        Self { rules }
    }

    /// Compile provider patterns from config
    pub fn from_config(patterns: &[PatternConfig]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| PatternRule::new(&p.regex, p.kind))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_rules(rules))
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Classify an error message; the same text always yields the same kind
    pub fn classify(&self, message: &str) -> ErrorKind {
        for rule in &self.rules {
            if rule.regex.is_match(message) {
                debug!(kind = %rule.kind, pattern = %rule.regex, "classify: provider pattern matched");
                return rule.kind;
            }
        }
        let kind = classify_shared(message);
        debug!(%kind, "classify: shared taxonomy result");
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_patterns_compile() {
        assert_eq!(SHARED_RULES.len(), SHARED_PATTERNS.len());
    }

    #[test]
    fn test_shared_taxonomy() {
        let cases = [
            ("Error: 429 Too Many Requests", ErrorKind::RateLimited),
            ("Claude usage limit reached. Your limit will reset at 4am", ErrorKind::RateLimited),
            ("OAuth token has expired. Please run /login", ErrorKind::AuthExpired),
            ("HTTP 401 Unauthorized", ErrorKind::AuthExpired),
            ("Invalid API key provided", ErrorKind::AuthExpired),
            ("Your credit balance is too low to access the API", ErrorKind::QuotaExceeded),
            ("insufficient_credits", ErrorKind::QuotaExceeded),
            ("request timed out after 300s", ErrorKind::Transient),
            ("read ECONNRESET", ErrorKind::Transient),
            ("503 Service Unavailable", ErrorKind::Transient),
            ("API overloaded_error", ErrorKind::Transient),
            ("invalid_request_error: prompt is too long", ErrorKind::Permanent),
            ("segmentation fault", ErrorKind::Permanent),
        ];
        let classifier = ErrorClassifier::new();
        for (message, expected) in cases {
            assert_eq!(classifier.classify(message), expected, "message: {}", message);
        }
    }

    #[test]
    fn test_rate_limit_wins_over_later_kinds() {
        // mentions both a rate limit and a timeout
        let message = "rate limit hit; request timed out";
        assert_eq!(classify_shared(message), ErrorKind::RateLimited);
    }

    #[test]
    fn test_provider_patterns_take_precedence() {
        let classifier = ErrorClassifier::with_rules(vec![
            PatternRule::new(r"(?i)exceeded your current quota", ErrorKind::QuotaExceeded).unwrap(),
        ]);
        let message = "429: You exceeded your current quota, please check your plan";

        assert_eq!(classify_shared(message), ErrorKind::RateLimited);
        assert_eq!(classifier.classify(message), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_provider_patterns_in_declared_order() {
        let classifier = ErrorClassifier::from_config(&[
            PatternConfig {
                kind: ErrorKind::Transient,
                regex: "capacity".to_string(),
            },
            PatternConfig {
                kind: ErrorKind::Permanent,
                regex: "capacity".to_string(),
            },
        ])
        .unwrap();
        assert_eq!(classifier.classify("no capacity"), ErrorKind::Transient);
    }

    #[test]
    fn test_classify_is_pure() {
        let classifier = ErrorClassifier::new();
        let message = "connection reset by peer";
        let first = classifier.classify(message);
        for _ in 0..10 {
            assert_eq!(classifier.classify(message), first);
        }
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = ErrorClassifier::from_config(&[PatternConfig {
            kind: ErrorKind::Transient,
            regex: "(unclosed".to_string(),
        }]);
        assert!(result.is_err());
    }
}
