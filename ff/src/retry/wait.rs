//! ConditionWait - poll a predicate on a monotonic clock
//!
//! Used for liveness and stuck detection, not for retrying work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Poll `predicate` every `poll_interval` until it returns true or `timeout`
/// elapses. Returns whether the predicate became true.
///
/// The predicate is always evaluated at least once, and once more at the
/// deadline.
pub async fn wait_for<F>(mut predicate: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    debug!(
        timeout_ms = timeout.as_millis() as u64,
        poll_ms = poll_interval.as_millis() as u64,
        "wait_for: called"
    );
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(Duration::from_millis(1));

    loop {
        if predicate() {
            debug!("wait_for: predicate satisfied");
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            debug!("wait_for: timed out");
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Tracks when a session last showed signs of life
///
/// Cloning shares the same clock.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = *self.last.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last)
    }

    /// Whether nothing was recorded for at least `window`
    pub fn is_idle(&self, window: Duration) -> bool {
        self.idle_for() >= window
    }
}
