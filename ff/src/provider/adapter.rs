//! ProviderAdapter trait and the shared base every adapter composes

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorKind;
use crate::retry::ActivityMonitor;

use super::classify::ErrorClassifier;
use super::error::ProviderError;
use super::health::{HealthTracker, ProviderHealth};
use super::redact::Redactor;
use super::reset::{ResetParser, ResetParserKind};

/// How much reasoning effort a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningTier {
    Low,
    Medium,
    High,
}

/// Static descriptor of what an adapter can do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCapabilities {
    #[serde(rename = "reasoning-tiers")]
    pub reasoning_tiers: Vec<ReasoningTier>,

    /// Context window in tokens
    #[serde(rename = "context-window")]
    pub context_window: u64,

    pub mcp: bool,

    #[serde(rename = "dangerous-mode")]
    pub dangerous_mode: bool,

    pub streaming: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            reasoning_tiers: vec![ReasoningTier::Low, ReasoningTier::Medium, ReasoningTier::High],
            context_window: 200_000,
            mcp: false,
            dangerous_mode: false,
            streaming: true,
        }
    }
}

impl ProviderCapabilities {
    pub fn supports(&self, tier: ReasoningTier) -> bool {
        self.reasoning_tiers.contains(&tier)
    }
}

/// Per-call options for a backend request
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Directory the backend runs in
    pub workspace: PathBuf,

    /// Start-to-close timeout for the call
    pub timeout: Duration,

    /// Required reasoning tier, if any
    pub reasoning: Option<ReasoningTier>,

    /// Cancelling this token kills the in-flight backend process
    pub kill: CancellationToken,

    /// Touched whenever the backend produces output
    pub activity: Option<ActivityMonitor>,
}

impl InvokeOptions {
    pub fn new(workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            timeout,
            reasoning: None,
            kill: CancellationToken::new(),
            activity: None,
        }
    }

    pub fn with_kill(mut self, kill: CancellationToken) -> Self {
        self.kill = kill;
        self
    }

    pub fn with_activity(mut self, activity: ActivityMonitor) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_reasoning(mut self, tier: ReasoningTier) -> Self {
        self.reasoning = Some(tier);
        self
    }

    pub(crate) fn touch(&self) {
        if let Some(activity) = &self.activity {
            activity.touch();
        }
    }
}

/// Successful backend output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutput {
    pub output: String,
    /// The backend explicitly signalled the task is complete
    pub completed: bool,
    pub tokens: u64,
    pub cost: f64,
}

/// Shared behaviour composed into every adapter: classification, redaction,
/// reset parsing and health tracking
#[derive(Debug)]
pub struct ProviderBase {
    pub name: String,
    pub capabilities: ProviderCapabilities,
    pub classifier: ErrorClassifier,
    pub redactor: Redactor,
    pub reset_parser: Box<dyn ResetParser>,
    pub health: HealthTracker,
}

impl ProviderBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: ProviderCapabilities::default(),
            classifier: ErrorClassifier::new(),
            redactor: Redactor::new(),
            reset_parser: ResetParserKind::Auto.build(),
            health: HealthTracker::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_reset_parser(mut self, reset_parser: Box<dyn ResetParser>) -> Self {
        self.reset_parser = reset_parser;
        self
    }

    /// Turn raw backend failure text into a classified, redacted error
    pub fn error(&self, raw: &str) -> ProviderError {
        let kind = self.classifier.classify(raw);
        let retry_after = match kind {
            ErrorKind::RateLimited => self.reset_parser.parse(raw, Local::now()),
            _ => None,
        };
        let message = self.redactor.redact(raw.trim()).into_owned();
        debug!(provider = %self.name, %kind, ?retry_after, "ProviderBase::error: classified");
        ProviderError::new(kind, &self.name, message).with_retry_after(retry_after)
    }

    /// Error of a known kind, message redacted
    pub fn error_of_kind(&self, kind: ErrorKind, message: &str) -> ProviderError {
        ProviderError::new(kind, &self.name, self.redactor.redact(message).into_owned())
    }
}

/// Uniform contract over one external backend
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Shared classification, redaction and health state
    fn base(&self) -> &ProviderBase;

    /// Whether the backend can be invoked at all right now
    async fn available(&self) -> bool;

    /// Send one prompt; failures come back already classified and redacted
    async fn send(&self, prompt: &str, options: &InvokeOptions) -> Result<BackendOutput, ProviderError>;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.base().capabilities
    }

    fn classify_error(&self, message: &str) -> ErrorKind {
        self.base().classifier.classify(message)
    }

    fn redact_secrets(&self, text: &str) -> String {
        self.base().redactor.redact(text).into_owned()
    }

    fn health_status(&self) -> ProviderHealth {
        self.base().health.snapshot()
    }

    fn health(&self) -> &HealthTracker {
        &self.base().health
    }
}
