//! Backend failure taxonomy shared by retry, provider and engine layers

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classified kind of a backend failure
///
/// Variants are declared in retry-priority order; classification checks
/// them in this order too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Switch provider, resume after the parsed reset time
    RateLimited,
    /// Switch provider; fatal when no fallback exists
    AuthExpired,
    /// Switch provider
    QuotaExceeded,
    /// Retry the same provider with backoff
    Transient,
    /// Never retried
    Permanent,
}

impl ErrorKind {
    /// All kinds in retry-priority order
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::RateLimited,
        ErrorKind::AuthExpired,
        ErrorKind::QuotaExceeded,
        ErrorKind::Transient,
        ErrorKind::Permanent,
    ];

    /// Whether the failure may go away on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }

    /// Whether the failure is handled by moving to another provider
    pub fn switches_provider(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::AuthExpired | ErrorKind::QuotaExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "auth_expired" => Ok(ErrorKind::AuthExpired),
            "quota_exceeded" => Ok(ErrorKind::QuotaExceeded),
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

/// An error that knows its classified kind
pub trait Classified {
    fn error_kind(&self) -> ErrorKind;

    /// Server-provided wait hint, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
