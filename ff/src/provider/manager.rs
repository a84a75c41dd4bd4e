//! ProviderManager - routes requests across adapters with failover
//!
//! Selection keeps the active adapter while it is healthy, not rate limited
//! and able to serve the requested reasoning tier. Otherwise the healthiest
//! eligible adapter takes over. Transient errors are retried on the same
//! adapter through [`Backoff`]; rate limits, expired auth and exhausted quota
//! move the request to another adapter.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::retry::{Backoff, RetryPolicy};

use super::adapter::{InvokeOptions, ProviderAdapter, ProviderCapabilities, ReasoningTier};
use super::cli::{AdapterConfig, CliAdapter};
use super::error::{ManagerError, ProviderError};
use super::health::ProviderHealth;

/// Upper bound on any single rate-limit block, whatever the backend says
const MAX_RESET_HINT: Duration = Duration::from_secs(24 * 3600);

/// Provider routing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Health score (0-100) below which the active adapter is replaced
    #[serde(rename = "health-threshold")]
    pub health_threshold: f64,

    /// Block applied after a rate limit when no reset time could be parsed
    #[serde(rename = "rate-limit-cooldown-ms")]
    pub rate_limit_cooldown_ms: u64,

    /// Total time one request may spend waiting for rate limits to lift
    #[serde(rename = "max-rate-limit-wait-ms")]
    pub max_rate_limit_wait_ms: u64,

    /// Same-adapter retry policy for transient failures
    pub retry: RetryPolicy,

    pub adapters: Vec<AdapterConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_threshold: 50.0,
            rate_limit_cooldown_ms: 60_000,
            max_rate_limit_wait_ms: 600_000,
            retry: RetryPolicy::default(),
            adapters: Vec::new(),
        }
    }
}

/// Output of a successful patch request
#[derive(Debug, Clone, PartialEq)]
pub struct PatchResult {
    pub output: String,
    pub completed: bool,
    /// Adapter that served the request
    pub provider: String,
    pub tokens: u64,
}

/// Health and routing state of one adapter
#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub name: String,
    pub active: bool,
    pub score: f64,
    pub rate_limited_for_ms: Option<u64>,
    pub health: ProviderHealth,
    pub capabilities: ProviderCapabilities,
}

enum Selection {
    Ready(usize),
    /// Every eligible adapter is rate limited; the earliest lifts after this
    RateLimited(Duration),
    None,
}

/// Routes requests across adapters; shared by every session
pub struct ProviderManager {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    active: AtomicUsize,
    config: ManagerConfig,
}

impl ProviderManager {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, config: ManagerConfig) -> Self {
        debug!(adapter_count = adapters.len(), "ProviderManager::new: called");
        Self {
            adapters,
            active: AtomicUsize::new(0),
            config,
        }
    }

    /// Build CLI adapters from config; `default_marker` applies to adapters
    /// without their own completion marker
    pub fn from_config(config: &ManagerConfig, default_marker: Option<&str>) -> Result<Self> {
        debug!(adapter_count = config.adapters.len(), "ProviderManager::from_config: called");
        let adapters = config
            .adapters
            .iter()
            .map(|adapter| {
                let mut adapter = adapter.clone();
                if adapter.completion_marker.is_none() {
                    adapter.completion_marker = default_marker.map(str::to_string);
                }
                CliAdapter::from_config(adapter).map(|a| Arc::new(a) as Arc<dyn ProviderAdapter>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(adapters, config.clone()))
    }

    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn active_name(&self) -> Option<&str> {
        self.adapters
            .get(self.active.load(Ordering::SeqCst))
            .map(|a| a.name())
    }

    /// Send a prompt through the best adapter, retrying and failing over
    ///
    /// Every attempt updates the health of the adapter that served it.
    pub async fn apply_patch(&self, prompt: &str, options: &InvokeOptions) -> Result<PatchResult, ManagerError> {
        debug!(prompt_len = prompt.len(), reasoning = ?options.reasoning, "ProviderManager::apply_patch: called");
        let max_wait = Duration::from_millis(self.config.max_rate_limit_wait_ms);
        let mut excluded: HashSet<usize> = HashSet::new();
        let mut last_kind: Option<ErrorKind> = None;
        let mut waited = Duration::ZERO;

        loop {
            if options.kill.is_cancelled() {
                debug!("ProviderManager::apply_patch: cancelled");
                return Err(ManagerError::Cancelled);
            }

            let index = match self.select(&excluded, options.reasoning).await {
                Selection::Ready(index) => index,
                Selection::RateLimited(wait) => {
                    if waited + wait > max_wait {
                        warn!(
                            wait_ms = wait.as_millis() as u64,
                            waited_ms = waited.as_millis() as u64,
                            "Every provider is rate limited beyond the wait limit"
                        );
                        return Err(ManagerError::NoProviderAvailable {
                            last: last_kind.or(Some(ErrorKind::RateLimited)),
                        });
                    }
                    info!(wait_ms = wait.as_millis() as u64, "All providers rate limited, waiting for reset");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = options.kill.cancelled() => return Err(ManagerError::Cancelled),
                    }
                    waited += wait;
                    continue;
                }
                Selection::None => {
                    warn!(last = ?last_kind, "No provider available");
                    return Err(ManagerError::NoProviderAvailable { last: last_kind });
                }
            };

            let adapter = Arc::clone(&self.adapters[index]);
            let err = match self.attempt(&adapter, prompt, options).await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            if options.kill.is_cancelled() {
                return Err(ManagerError::Cancelled);
            }
            last_kind = Some(err.kind);

            match err.kind {
                ErrorKind::RateLimited => {
                    warn!(provider = %adapter.name(), error = %err, "Provider rate limited, failing over");
                }
                ErrorKind::AuthExpired | ErrorKind::QuotaExceeded => {
                    warn!(provider = %adapter.name(), error = %err, "Provider unusable, failing over");
                    excluded.insert(index);
                }
                ErrorKind::Transient | ErrorKind::Permanent => {
                    debug!(provider = %adapter.name(), kind = %err.kind, "ProviderManager::apply_patch: giving up");
                    return Err(err.into());
                }
            }
        }
    }

    /// One adapter, with same-adapter retries for transient failures
    async fn attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<PatchResult, ProviderError> {
        debug!(provider = %adapter.name(), "ProviderManager::attempt: called");
        let backoff = Backoff::new(self.config.retry.clone()).with_cancel(options.kill.clone());

        let output = backoff
            .retry(|attempt| {
                let adapter = Arc::clone(adapter);
                async move {
                    debug!(provider = %adapter.name(), attempt, "ProviderManager::attempt: sending");
                    let start = Instant::now();
                    let result = adapter.send(prompt, options).await;
                    let elapsed = start.elapsed();
                    match &result {
                        Ok(out) => adapter.health().record_success(elapsed, out.tokens, out.cost),
                        Err(e) => {
                            let block = (e.kind == ErrorKind::RateLimited).then(|| self.rate_limit_block(e));
                            adapter.health().record_failure(e.kind, elapsed, block);
                        }
                    }
                    result
                }
            })
            .await?;

        Ok(PatchResult {
            output: output.output,
            completed: output.completed,
            provider: adapter.name().to_string(),
            tokens: output.tokens,
        })
    }

    fn rate_limit_block(&self, err: &ProviderError) -> Duration {
        let cooldown = Duration::from_millis(self.config.rate_limit_cooldown_ms.max(1));
        let block = err.retry_after.unwrap_or(cooldown).min(MAX_RESET_HINT);
        debug!(hint = ?err.retry_after, block_ms = block.as_millis() as u64, "ProviderManager::rate_limit_block: called");
        block.max(Duration::from_millis(1))
    }

    fn eligible(&self, index: usize, excluded: &HashSet<usize>, tier: Option<ReasoningTier>) -> bool {
        !excluded.contains(&index) && tier.is_none_or(|t| self.adapters[index].capabilities().supports(t))
    }

    async fn select(&self, excluded: &HashSet<usize>, tier: Option<ReasoningTier>) -> Selection {
        let active = self.active.load(Ordering::SeqCst);
        if let Some(adapter) = self.adapters.get(active)
            && self.eligible(active, excluded, tier)
            && !adapter.health().is_rate_limited()
            && adapter.health().score() >= self.config.health_threshold
            && adapter.available().await
        {
            debug!(provider = %adapter.name(), "ProviderManager::select: keeping active provider");
            return Selection::Ready(active);
        }

        let mut best: Option<(usize, f64)> = None;
        let mut earliest: Option<Duration> = None;
        for (index, adapter) in self.adapters.iter().enumerate() {
            if !self.eligible(index, excluded, tier) {
                continue;
            }
            if let Some(remaining) = adapter.health().rate_limited_for() {
                earliest = Some(earliest.map_or(remaining, |e| e.min(remaining)));
                continue;
            }
            if !adapter.available().await {
                debug!(provider = %adapter.name(), "ProviderManager::select: provider unavailable");
                continue;
            }
            let score = adapter.health().score();
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((index, score));
            }
        }

        match (best, earliest) {
            (Some((index, score)), _) => {
                if index != active {
                    info!(
                        from = self.adapters.get(active).map(|a| a.name()).unwrap_or("-"),
                        to = %self.adapters[index].name(),
                        score,
                        "Switching provider"
                    );
                    self.active.store(index, Ordering::SeqCst);
                }
                Selection::Ready(index)
            }
            (None, Some(wait)) => Selection::RateLimited(wait),
            (None, None) => Selection::None,
        }
    }

    /// Health and routing state of every adapter
    pub fn health_report(&self) -> Vec<ProviderReport> {
        let active = self.active.load(Ordering::SeqCst);
        self.adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                let health = adapter.health_status();
                ProviderReport {
                    name: adapter.name().to_string(),
                    active: index == active,
                    score: health.score(),
                    rate_limited_for_ms: adapter.health().rate_limited_for().map(|d| d.as_millis() as u64),
                    health,
                    capabilities: adapter.capabilities().clone(),
                }
            })
            .collect()
    }

    /// Clear the counters of one adapter; returns whether it exists
    pub fn reset_health(&self, name: &str) -> bool {
        debug!(%name, "ProviderManager::reset_health: called");
        match self.adapters.iter().find(|a| a.name() == name) {
            Some(adapter) => {
                adapter.health().reset();
                info!(provider = %name, "Provider health reset");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::adapter::mock::{ScriptedAdapter, Step};
    use tokio_util::sync::CancellationToken;

    fn config() -> ManagerConfig {
        ManagerConfig {
            retry: RetryPolicy::constant(Duration::from_millis(1)).with_max_attempts(3),
            rate_limit_cooldown_ms: 60_000,
            max_rate_limit_wait_ms: 5_000,
            ..Default::default()
        }
    }

    fn manager(adapters: &[Arc<ScriptedAdapter>], config: ManagerConfig) -> ProviderManager {
        let adapters = adapters
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn ProviderAdapter>)
            .collect();
        ProviderManager::new(adapters, config)
    }

    fn options() -> InvokeOptions {
        InvokeOptions::new("/tmp", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_on_active_provider() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("patched")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("other")]));
        let manager = manager(&[a.clone(), b.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.output, "patched");
        assert!(result.completed);
        assert_eq!(result.provider, "a");
        assert_eq!(b.calls(), 0);
        assert_eq!(a.health_status().successful_requests, 1);
    }

    #[tokio::test]
    async fn test_transient_retried_on_same_provider() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("connection reset"), Step::done("ok")]));
        let manager = manager(&[a.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.provider, "a");
        assert_eq!(a.calls(), 2);

        let health = a.health_status();
        assert_eq!(health.total_requests, 2);
        assert_eq!(health.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_transient_exhausted_returns_error() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("503 Service Unavailable")]));
        let manager = manager(&[a.clone()], config());

        let err = manager.apply_patch("fix", &options()).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Transient));
        assert!(!err.is_fatal());
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("invalid request: prompt too long")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("ok")]));
        let manager = manager(&[a.clone(), b.clone()], config());

        let err = manager.apply_patch("fix", &options()).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Permanent));
        assert!(err.is_fatal());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_fails_over() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("429 Too Many Requests")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("from b")]));
        let manager = manager(&[a.clone(), b.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.provider, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(manager.active_name(), Some("b"));

        let report = manager.health_report();
        assert!(report[0].rate_limited_for_ms.is_some());
        assert_eq!(report[0].health.rate_limited_requests, 1);
        assert!(report[1].active);
    }

    #[tokio::test]
    async fn test_auth_expired_without_fallback_is_fatal() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("OAuth token has expired")]));
        let manager = manager(&[a.clone()], config());

        let err = manager.apply_patch("fix", &options()).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::NoProviderAvailable {
                last: Some(ErrorKind::AuthExpired)
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_quota_exceeded_fails_over() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("Your credit balance is too low")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("ok")]));
        let manager = manager(&[a.clone(), b.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.provider, "b");
    }

    #[tokio::test]
    async fn test_waits_for_short_rate_limit() {
        let a = Arc::new(ScriptedAdapter::new(
            "a",
            vec![Step::fail("rate limit exceeded, retry after 50ms"), Step::done("ok")],
        ));
        let manager = manager(&[a.clone()], config());

        let start = std::time::Instant::now();
        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.output, "ok");
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_beyond_wait_limit_is_fatal() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::fail("429: retry after 600s")]));
        let mut config = config();
        config.max_rate_limit_wait_ms = 100;
        let manager = manager(&[a.clone()], config);

        let start = std::time::Instant::now();
        let err = manager.apply_patch("fix", &options()).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::NoProviderAvailable {
                last: Some(ErrorKind::RateLimited)
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unhealthy_active_replaced() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("from a")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("from b")]));
        for _ in 0..5 {
            a.health().record_failure(ErrorKind::Transient, Duration::ZERO, None);
        }
        let manager = manager(&[a.clone(), b.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.provider, "b");
    }

    #[tokio::test]
    async fn test_unavailable_provider_skipped() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("from a")]));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("from b")]));
        a.set_available(false);
        let manager = manager(&[a.clone(), b.clone()], config());

        let result = manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(result.provider, "b");

        b.set_available(false);
        let err = manager.apply_patch("fix", &options()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NoProviderAvailable { last: None }));
    }

    #[tokio::test]
    async fn test_reasoning_tier_routing() {
        let low_only = ProviderCapabilities {
            reasoning_tiers: vec![ReasoningTier::Low],
            ..Default::default()
        };
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("from a")]).with_capabilities(low_only));
        let b = Arc::new(ScriptedAdapter::new("b", vec![Step::done("from b")]));
        let manager = manager(&[a.clone(), b.clone()], config());

        let high = options().with_reasoning(ReasoningTier::High);
        assert_eq!(manager.apply_patch("fix", &high).await.unwrap().provider, "b");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("ok")]));
        let manager = manager(&[a.clone()], config());
        let kill = CancellationToken::new();
        kill.cancel();

        let err = manager.apply_patch("fix", &options().with_kill(kill)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Cancelled));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_kill_during_hang_reports_cancelled() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::Hang]));
        let manager = manager(&[a.clone()], config());
        let kill = CancellationToken::new();
        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager.apply_patch("fix", &options().with_kill(kill)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Cancelled));
    }

    #[tokio::test]
    async fn test_reset_health() {
        let a = Arc::new(ScriptedAdapter::new("a", vec![Step::done("ok")]));
        let manager = manager(&[a.clone()], config());
        manager.apply_patch("fix", &options()).await.unwrap();
        assert_eq!(a.health_status().total_requests, 1);

        assert!(manager.reset_health("a"));
        assert_eq!(a.health_status().total_requests, 0);
        assert!(!manager.reset_health("missing"));
    }

    #[test]
    fn test_from_config_applies_default_marker() {
        let config = ManagerConfig {
            adapters: vec![AdapterConfig::new("sh", "sh")],
            ..Default::default()
        };
        let manager = ProviderManager::from_config(&config, Some("DONE")).unwrap();
        assert_eq!(manager.adapters().len(), 1);
        assert_eq!(manager.active_name(), Some("sh"));
    }
}
