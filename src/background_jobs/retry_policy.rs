//! Retry policy for failed job attempts.
//!
//! Implements capped exponential backoff with optional additive jitter.

use super::tier::TierPolicy;
use rand::Rng;
use std::time::Duration;

/// Fraction of the base delay that jitter may add on top of it.
const JITTER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_base: f64,
    pub jitter_enabled: bool,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retries_used` retries.
    pub fn should_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }

    /// Delay before retry `retry` (1-indexed), without jitter.
    ///
    /// `min(initial_delay * backoff_base^(retry - 1), max_delay)`
    pub fn backoff(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_base.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay before retry `retry`, with jitter in `[0, 0.1 * backoff]` added when enabled.
    pub fn delay_for<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter_enabled || base.is_zero() {
            return base;
        }
        let jitter = rng.random_range(0.0..=base.as_secs_f64() * JITTER_FRACTION);
        base + Duration::from_secs_f64(jitter)
    }
}

impl From<&TierPolicy> for RetryPolicy {
    fn from(policy: &TierPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            backoff_base: policy.backoff_base,
            jitter_enabled: policy.jitter_enabled,
        }
    }
}
