//! Exponential backoff retry policy with optional jitter.
//!
//! The base delay for retry `n` (zero-based) is
//! `min(initial_delay * backoff_multiplier^n, max_delay)`. With the default
//! policy that yields 60s, 120s, 240s, 480s and 960s before giving up.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry policy for failed event processing.
///
/// Supplied when a retry is scheduled and immutable afterwards. The scheduler
/// checkpoints the policy with each pending retry so recovery uses the same
/// curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries allowed after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Factor applied to the delay for each further retry.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied after capping.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            initial_delay: crate::DEFAULT_INITIAL_DELAY,
            backoff_multiplier: 2.0,
            max_delay: crate::DEFAULT_MAX_DELAY,
            jitter_factor: 0.0,
        }
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before the next attempt
        delay: Duration,
    },
    /// Do not retry.
    GiveUp {
        /// Reason why no retry will be made
        reason: String,
    },
}

impl RetryPolicy {
    /// Checks that the policy can produce a sane backoff curve.
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(DeliveryError::configuration("initial_delay must be positive"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DeliveryError::configuration("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(DeliveryError::configuration("max_delay must not be below initial_delay"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Returns the capped base delay for the retry with index `retry_count`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        if !raw_ms.is_finite() || raw_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(raw_ms.round() as u64)
    }

    /// Returns the delay to actually wait, jittered and re-capped.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let delay = apply_jitter(self.delay_for(retry_count), self.jitter_factor);
        std::cmp::min(delay, self.max_delay)
    }

    /// Decides whether the retry with index `retry_count` should be made.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum retries ({}) exhausted", self.max_retries),
            };
        }

        RetryDecision::Retry { delay: self.next_delay(retry_count) }
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor. With jitter_factor=0.25, a 10s
/// delay becomes 7.5s to 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_sequence_is_exact() {
        let policy = RetryPolicy::default();

        let delays: Vec<u128> = (0..5).map(|n| policy.next_delay(n).as_millis()).collect();

        assert_eq!(delays, vec![60_000, 120_000, 240_000, 480_000, 960_000]);
    }

    #[test]
    fn retry_respects_maximum_retries() {
        let policy = RetryPolicy::default();

        assert!(matches!(policy.decide(4), RetryDecision::Retry { .. }));
        match policy.decide(5) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum retries")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max retries"),
        }
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(300), ..Default::default() };

        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for(3), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_varies_delay_within_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            jitter_factor: 0.5,
            ..Default::default()
        };

        let mut seen_delays = std::collections::HashSet::new();
        for _ in 0..20 {
            seen_delays.insert(policy.next_delay(0).as_millis());
        }

        assert!(seen_delays.len() > 1, "jitter should create variation");
        for &delay_ms in &seen_delays {
            assert!(delay_ms >= 5_000, "delay too small: {delay_ms}ms");
            assert!(delay_ms <= 15_000, "delay too large: {delay_ms}ms");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter_factor: 1.0,
            ..Default::default()
        };

        for _ in 0..50 {
            assert!(policy.next_delay(3) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { backoff_multiplier: 0.5, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { initial_delay: Duration::ZERO, ..Default::default() }
            .validate()
            .is_err());
        assert!(RetryPolicy { max_delay: Duration::from_secs(1), ..Default::default() }
            .validate()
            .is_err());
    }
}
