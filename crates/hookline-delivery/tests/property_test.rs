//! Property-based tests for backoff curves and metric arithmetic.

use std::time::Duration;

use hookline_delivery::{HealthStatus, MetricBucket, RetryDecision, RetryPolicy};
use proptest::prelude::*;

/// Strategy for generating valid retry policies.
fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..20,          // max_retries
        1u64..120_000,     // initial_delay_ms
        1.0f64..4.0,       // backoff_multiplier
        0u64..10_000_000,  // extra headroom above initial for max_delay_ms
        0.0f64..=1.0,      // jitter_factor
    )
        .prop_map(|(max_retries, initial_ms, backoff_multiplier, headroom_ms, jitter_factor)| {
            RetryPolicy {
                max_retries,
                initial_delay: Duration::from_millis(initial_ms),
                backoff_multiplier,
                max_delay: Duration::from_millis(initial_ms + headroom_ms),
                jitter_factor,
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn generated_policies_validate(policy in retry_policy_strategy()) {
        prop_assert!(policy.validate().is_ok());
    }

    #[test]
    fn base_delay_never_decreases(policy in retry_policy_strategy(), retry in 0u32..64) {
        prop_assert!(policy.delay_for(retry) <= policy.delay_for(retry + 1));
    }

    #[test]
    fn delays_respect_the_cap(policy in retry_policy_strategy(), retry in 0u32..1_000) {
        prop_assert!(policy.delay_for(retry) <= policy.max_delay);
        prop_assert!(policy.next_delay(retry) <= policy.max_delay);
    }

    #[test]
    fn first_retry_waits_the_initial_delay(policy in retry_policy_strategy()) {
        prop_assert_eq!(policy.delay_for(0), policy.initial_delay);
    }

    #[test]
    fn default_policy_doubles_until_capped(retry in 0u32..32) {
        let policy = RetryPolicy::default();
        let expected = 60u64.saturating_mul(1u64 << retry.min(20)).min(3600);
        prop_assert_eq!(policy.delay_for(retry), Duration::from_secs(expected));
    }

    #[test]
    fn decisions_give_up_exactly_at_max(policy in retry_policy_strategy(), retry in 0u32..40) {
        let decision = policy.decide(retry);
        if retry < policy.max_retries {
            let retried = matches!(decision, RetryDecision::Retry { .. });
            prop_assert!(retried);
        } else {
            let gave_up = matches!(decision, RetryDecision::GiveUp { .. });
            prop_assert!(gave_up);
        }
    }

    #[test]
    fn success_rate_stays_in_percent_range(successes in 0u64..10_000, failures in 0u64..10_000) {
        let bucket = MetricBucket {
            count: successes + failures,
            success_count: successes,
            failure_count: failures,
            ..MetricBucket::default()
        };

        let rate = bucket.success_rate();
        prop_assert!((0.0..=100.0).contains(&rate));
        if failures == 0 && successes > 0 {
            prop_assert!((rate - 100.0).abs() < 1e-9);
        }
        if successes == 0 {
            prop_assert!(rate.abs() < 1e-9);
        }
    }

    #[test]
    fn health_degrades_with_success_rate(low in 0.0f64..=100.0, high in 0.0f64..=100.0) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let rank = |status: HealthStatus| match status {
            HealthStatus::Critical => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Healthy => 2,
        };
        prop_assert!(rank(HealthStatus::from_success_rate(low)) <= rank(HealthStatus::from_success_rate(high)));
    }
}
