//! Retry policies for the layer above the transport handler.
//!
//! The handler never retries on its own; it surfaces typed errors and the
//! embedding client consults one of these policies to decide whether and
//! when to try again.

use std::time::Duration;

use rand::Rng;

use crate::error::IotHubError;

/// Decides whether an operation that failed with `last_error` should run
/// again, and after what delay. `current_retry_count` starts at 1 for the
/// first retry decision.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, current_retry_count: u32, last_error: &IotHubError) -> Option<Duration>;
}

fn jittered(delay: Duration, use_jitter: bool) -> Duration {
    if !use_jitter {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.95..=1.05);
    delay.mul_f64(factor)
}

fn exhausted(max_retries: u32, current_retry_count: u32) -> bool {
    max_retries != 0 && current_retry_count > max_retries
}

/// Waits the same interval between every attempt.
#[derive(Debug, Clone)]
pub struct FixedDelayRetryPolicy {
    /// 0 = unbounded.
    pub max_retries: u32,
    pub delay: Duration,
    pub use_jitter: bool,
}

impl FixedDelayRetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            use_jitter: true,
        }
    }
}

impl RetryPolicy for FixedDelayRetryPolicy {
    fn should_retry(&self, current_retry_count: u32, last_error: &IotHubError) -> Option<Duration> {
        if !last_error.is_transient() || exhausted(self.max_retries, current_retry_count) {
            return None;
        }
        Some(jittered(self.delay, self.use_jitter))
    }
}

/// Doubles the wait on every attempt, bounded between a minimum and a
/// maximum backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetryPolicy {
    /// 0 = unbounded.
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub use_jitter: bool,
}

impl Default for ExponentialBackoffRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            use_jitter: true,
        }
    }
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn should_retry(&self, current_retry_count: u32, last_error: &IotHubError) -> Option<Duration> {
        if !last_error.is_transient() || exhausted(self.max_retries, current_retry_count) {
            return None;
        }
        let exponent = current_retry_count.saturating_sub(1).min(30);
        let delay = self
            .min_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        Some(jittered(delay, self.use_jitter))
    }
}

/// Grows the wait by a fixed increment on every attempt.
#[derive(Debug, Clone)]
pub struct IncrementalDelayRetryPolicy {
    /// 0 = unbounded.
    pub max_retries: u32,
    pub increment: Duration,
    pub use_jitter: bool,
}

impl IncrementalDelayRetryPolicy {
    pub fn new(max_retries: u32, increment: Duration) -> Self {
        Self {
            max_retries,
            increment,
            use_jitter: true,
        }
    }
}

impl RetryPolicy for IncrementalDelayRetryPolicy {
    fn should_retry(&self, current_retry_count: u32, last_error: &IotHubError) -> Option<Duration> {
        if !last_error.is_transient() || exhausted(self.max_retries, current_retry_count) {
            return None;
        }
        let delay = self.increment.saturating_mul(current_retry_count);
        Some(jittered(delay, self.use_jitter))
    }
}
