//! Provider abstraction over external agent backends
//!
//! - [`ProviderAdapter`]: uniform contract over one backend, composed with a
//!   [`ProviderBase`] supplying classification, redaction and health
//! - [`CliAdapter`]: adapter that runs an agent CLI as a subprocess
//! - [`ProviderManager`]: selection, same-adapter retry and failover

mod adapter;
mod classify;
mod cli;
mod error;
mod health;
mod manager;
mod redact;
mod reset;

pub use adapter::{
    BackendOutput, InvokeOptions, ProviderAdapter, ProviderBase, ProviderCapabilities, ReasoningTier,
};
pub use classify::{ErrorClassifier, PatternConfig, PatternRule, classify_shared};
pub use cli::{AdapterConfig, CliAdapter, PROMPT_PLACEHOLDER, resolve_program};
pub use error::{ManagerError, ProviderError};
pub use health::{HealthTracker, ProviderHealth};
pub use manager::{ManagerConfig, PatchResult, ProviderManager, ProviderReport};
pub use redact::{REDACTION_MARKER, Redactor, redact_secrets};
pub use reset::{ChainParser, ClockResetParser, NoResetParser, ResetParser, ResetParserKind, RetryAfterParser};

#[cfg(test)]
pub use adapter::mock;
