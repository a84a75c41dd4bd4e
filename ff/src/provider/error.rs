//! Error types for provider operations

use std::time::Duration;

use crate::error::{Classified, ErrorKind};

/// A classified failure reported by one adapter
///
/// The message is always redacted by the owning adapter before construction.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub provider: String,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl Classified for ProviderError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Errors surfaced by the provider manager to the work loop
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("No provider available{}", describe_last(.last))]
    NoProviderAvailable { last: Option<ErrorKind> },

    #[error("Request cancelled")]
    Cancelled,
}

fn describe_last(last: &Option<ErrorKind>) -> String {
    last.map(|kind| format!(" (last error: {})", kind)).unwrap_or_default()
}

impl ManagerError {
    /// Classified kind, where one applies
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ManagerError::Provider(e) => Some(e.kind),
            ManagerError::NoProviderAvailable { last } => *last,
            ManagerError::Cancelled => None,
        }
    }

    /// Whether the engine must stop with a failed outcome
    pub fn is_fatal(&self) -> bool {
        match self {
            ManagerError::Provider(e) => e.kind != ErrorKind::Transient,
            ManagerError::NoProviderAvailable { .. } => true,
            ManagerError::Cancelled => false,
        }
    }
}
