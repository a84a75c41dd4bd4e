//! Rolling per-adapter health counters

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ErrorKind;

const SUCCESS_WEIGHT: f64 = 0.7;
const RATE_LIMIT_WEIGHT: f64 = 0.3;

/// Snapshot of an adapter's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_response_ms: f64,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub fn rate_limit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rate_limited_requests as f64 / self.total_requests as f64
        }
    }

    /// Weighted combination of success rate and inverse rate-limit ratio, 0-100
    pub fn score(&self) -> f64 {
        let score = 100.0 * (SUCCESS_WEIGHT * self.success_rate() + RATE_LIMIT_WEIGHT * (1.0 - self.rate_limit_ratio()));
        score.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    health: ProviderHealth,
    /// Monotonic deadline used for routing decisions
    blocked_until: Option<Instant>,
}

/// Lock-guarded health counters owned by one adapter
///
/// Every method takes the lock only for the duration of the update.
#[derive(Debug, Default)]
pub struct HealthTracker {
    state: Mutex<TrackerState>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn record_request(health: &mut ProviderHealth, elapsed: Duration) {
        health.total_requests += 1;
        let n = health.total_requests as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        health.avg_response_ms += (ms - health.avg_response_ms) / n;
    }

    /// Record a successful request
    pub fn record_success(&self, elapsed: Duration, tokens: u64, cost: f64) {
        debug!(elapsed_ms = elapsed.as_millis() as u64, tokens, "HealthTracker::record_success: called");
        self.with_state(|state| {
            Self::record_request(&mut state.health, elapsed);
            state.health.successful_requests += 1;
            state.health.total_tokens += tokens;
            if cost.is_finite() && cost > 0.0 {
                state.health.total_cost += cost;
            }
        });
    }

    /// Record a failed request; rate limits also block the adapter for `cooldown`
    pub fn record_failure(&self, kind: ErrorKind, elapsed: Duration, cooldown: Option<Duration>) {
        debug!(%kind, elapsed_ms = elapsed.as_millis() as u64, ?cooldown, "HealthTracker::record_failure: called");
        self.with_state(|state| {
            Self::record_request(&mut state.health, elapsed);
            state.health.failed_requests += 1;
            if kind == ErrorKind::RateLimited {
                state.health.rate_limited_requests += 1;
                if let Some(cooldown) = cooldown {
                    let until = Instant::now() + cooldown;
                    // never shorten an existing block
                    if state.blocked_until.is_none_or(|current| current < until) {
                        state.blocked_until = Some(until);
                        state.health.rate_limited_until = chrono::Duration::from_std(cooldown)
                            .ok()
                            .map(|d| Utc::now() + d);
                    }
                }
            }
        });
    }

    /// Remaining rate-limit block, if any
    pub fn rate_limited_for(&self) -> Option<Duration> {
        self.with_state(|state| {
            let until = state.blocked_until?;
            let remaining = until.saturating_duration_since(Instant::now());
            (!remaining.is_zero()).then_some(remaining)
        })
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited_for().is_some()
    }

    pub fn snapshot(&self) -> ProviderHealth {
        self.with_state(|state| {
            let mut health = state.health.clone();
            if state.blocked_until.is_none_or(|until| until <= Instant::now()) {
                health.rate_limited_until = None;
            }
            health
        })
    }

    pub fn score(&self) -> f64 {
        self.snapshot().score()
    }

    /// Clear every counter and any rate-limit block
    pub fn reset(&self) {
        debug!("HealthTracker::reset: called");
        self.with_state(|state| *state = TrackerState::default());
    }
}
