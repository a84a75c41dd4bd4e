//! Backoff - retry policy evaluation and a retry driver
//!
//! Delay for attempt `n` (1-based), before jitter:
//! - exponential: `base * coefficient^(n-1)`
//! - linear: `base * n`
//! - constant: `base`
//!
//! All strategies are capped at `max-delay-ms`. Jitter then multiplies the
//! delay by a uniform factor in `[1 - jitter, 1 + jitter]`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Classified, ErrorKind};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Constant,
}

/// Immutable retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Fraction in [0, 1]
    pub jitter: f64,

    /// Growth factor for the exponential strategy
    pub coefficient: f64,

    pub strategy: BackoffStrategy,

    /// Error kinds this policy retries
    #[serde(rename = "retry-on")]
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
            coefficient: 2.0,
            strategy: BackoffStrategy::Exponential,
            retry_on: vec![ErrorKind::Transient],
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        }
    }

    pub fn constant(delay: Duration) -> Self {
        Self {
            base_delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            strategy: BackoffStrategy::Constant,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether the policy applies to this error kind
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

/// Delay before retry number `attempt`, without jitter
///
/// `attempt` is 1-based; 0 is treated as 1.
pub fn base_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let base = policy.base_delay_ms as f64;
    let max = policy.max_delay_ms as f64;

    let raw = match policy.strategy {
        BackoffStrategy::Exponential => {
            // a coefficient below 1 would make delays shrink
            let coefficient = if policy.coefficient.is_finite() {
                policy.coefficient.max(1.0)
            } else {
                1.0
            };
            let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
            base * coefficient.powi(exponent)
        }
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Constant => base,
    };

    Duration::from_millis(raw.min(max).max(0.0) as u64)
}

/// Delay before retry number `attempt`, with jitter applied
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay = base_delay(attempt, policy);
    let jitter = if policy.jitter.is_finite() {
        policy.jitter.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }

    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    let jittered = delay.mul_f64(factor);
    jittered.min(Duration::from_millis(policy.max_delay_ms))
}

/// Retry driver bound to a policy
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        debug!(?policy, "Backoff::new: called");
        Self { policy, cancel: None }
    }

    /// Abort waiting between attempts when the token fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        next_delay(attempt, &self.policy)
    }

    /// Call `operation` until it succeeds or the policy gives up
    ///
    /// The closure receives the 1-based attempt number. Errors whose kind is
    /// not in the retryable set, the error of the last allowed attempt, and
    /// the pending error when cancelled are returned unchanged. Only apply
    /// this to operations that are safe to repeat.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Classified + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1u32;
        loop {
            debug!(attempt, max_attempts = self.policy.max_attempts, "retry: calling operation");
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = err.error_kind();
            if !self.policy.retries(kind) {
                debug!(attempt, %kind, "retry: kind not retryable, giving up");
                return Err(err);
            }
            if attempt >= self.policy.max_attempts {
                debug!(attempt, %kind, "retry: attempts exhausted");
                return Err(err);
            }

            let delay = self.next_delay(attempt);
            warn!(attempt, %kind, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after failure");

            match &self.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(attempt, "retry: cancelled while waiting");
                            return Err(err);
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorKind);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Classified for TestError {
        fn error_kind(&self) -> ErrorKind {
            self.0
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::constant(Duration::from_millis(1)).with_jitter(0.0)
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(base_delay(1, &policy), Duration::from_millis(100));
        assert_eq!(base_delay(2, &policy), Duration::from_millis(200));
        assert_eq!(base_delay(3, &policy), Duration::from_millis(400));
        assert_eq!(base_delay(4, &policy), Duration::from_millis(800));
        assert_eq!(base_delay(5, &policy), Duration::from_millis(1_000));
        assert_eq!(base_delay(500, &policy), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = RetryPolicy::linear(Duration::from_millis(50), Duration::from_millis(120));
        assert_eq!(base_delay(1, &linear), Duration::from_millis(50));
        assert_eq!(base_delay(2, &linear), Duration::from_millis(100));
        assert_eq!(base_delay(3, &linear), Duration::from_millis(120));

        let constant = RetryPolicy::constant(Duration::from_millis(75));
        assert_eq!(base_delay(1, &constant), Duration::from_millis(75));
        assert_eq!(base_delay(9, &constant), Duration::from_millis(75));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::constant(Duration::from_millis(1_000))
            .with_jitter(0.25)
            .with_max_attempts(5);
        let policy = RetryPolicy {
            max_delay_ms: 10_000,
            ..policy
        };
        for _ in 0..200 {
            let delay = next_delay(1, &policy).as_millis();
            assert!((750..=1_250).contains(&delay), "delay {} out of band", delay);
        }
    }

    proptest! {
        #[test]
        fn prop_exponential_monotonic_and_capped(
            base in 1u64..5_000,
            max in 1u64..120_000,
            coefficient in 0.5f64..4.0,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy {
                base_delay_ms: base,
                max_delay_ms: max,
                coefficient,
                jitter: 0.0,
                ..Default::default()
            };
            let this = base_delay(attempt, &policy);
            let next = base_delay(attempt + 1, &policy);
            prop_assert!(this <= next);
            prop_assert!(next <= Duration::from_millis(max));
        }

        #[test]
        fn prop_jittered_never_exceeds_max(
            base in 1u64..5_000,
            max in 1u64..60_000,
            jitter in 0.0f64..1.0,
            attempt in 1u32..32,
        ) {
            let policy = RetryPolicy {
                base_delay_ms: base,
                max_delay_ms: max,
                jitter,
                ..Default::default()
            };
            prop_assert!(next_delay(attempt, &policy) <= Duration::from_millis(max));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(fast_policy().with_max_attempts(5));

        let counter = calls.clone();
        let result: Result<&str, TestError> = backoff
            .retry(|_attempt| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError(ErrorKind::Transient))
                    } else {
                        Ok("patched")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "patched");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(fast_policy().with_max_attempts(3));

        let counter = calls.clone();
        let result: Result<(), TestError> = backoff
            .retry(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorKind::Transient)) }
            })
            .await;

        assert_eq!(result.unwrap_err().0, ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_other_kinds() {
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(fast_policy().with_max_attempts(5));

        let counter = calls.clone();
        let result: Result<(), TestError> = backoff
            .retry(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorKind::Permanent)) }
            })
            .await;

        assert_eq!(result.unwrap_err().0, ErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_stops_waiting_when_cancelled() {
        let cancel = CancellationToken::new();
        let backoff = Backoff::new(
            RetryPolicy::constant(Duration::from_secs(60))
                .with_jitter(0.0)
                .with_max_attempts(10),
        )
        .with_cancel(cancel.clone());

        cancel.cancel();
        let result: Result<(), TestError> = tokio::time::timeout(
            Duration::from_secs(5),
            backoff.retry(|_| async { Err(TestError(ErrorKind::Transient)) }),
        )
        .await
        .expect("retry should return promptly once cancelled");

        assert_eq!(result.unwrap_err().0, ErrorKind::Transient);
    }
}
