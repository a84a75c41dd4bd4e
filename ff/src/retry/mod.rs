//! Retry and wait primitives
//!
//! - [`Backoff`] evaluates a [`RetryPolicy`] and drives retries of operations
//!   that are safe to repeat
//! - [`wait_for`] polls a predicate on a monotonic clock for liveness checks

mod backoff;
mod wait;

pub use backoff::{Backoff, BackoffStrategy, RetryPolicy, base_delay, next_delay};
pub use wait::{ActivityMonitor, wait_for};
