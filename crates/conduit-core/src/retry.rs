//! # Retry Policy Module
//!
//! Exponential backoff with jitter shared by inbound handler retries and
//! outbound calls.
//!
//! The delay before retry `n` (0-based) is
//! `min(cap, base * 2^n) ± random(0, 0.1 * delay)`, clamped so that it never
//! exceeds the cap.

use rand::RngExt;
use std::time::Duration;

use crate::provider::Provider;

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use conduit_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(300));
///
/// assert!(policy.calculate_delay(10) <= Duration::from_secs(300));
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (default 10%)
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a new retry policy with 10% jitter.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            use_jitter: true,
            jitter_fraction: 0.1,
        }
    }

    /// Build the policy configured for a provider.
    pub fn for_provider(provider: &Provider) -> Self {
        Self::new(
            provider.max_retries,
            provider.backoff_base,
            provider.backoff_cap,
        )
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let cap_secs = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped_secs = base_secs.min(cap_secs);

        let final_secs = if self.use_jitter && capped_secs > 0.0 {
            let jitter_range = capped_secs * self.jitter_fraction;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (capped_secs + jitter).clamp(0.0, cap_secs)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
