//! Retry backoff policy.
//!
//! Given the 1-indexed number of the attempt that just failed:
//!
//! ```text
//! fixed       -> delay
//! linear      -> delay * attempt
//! exponential -> delay * 2^(attempt - 1)
//! ```
//!
//! capped at the policy's max delay. No jitter.

use chrono::{DateTime, Duration, Utc};

use crate::db::models::subscriptions::RetryStrategy;

/// Per-subscription retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub delay_seconds: i32,
    pub max_delay_seconds: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            delay_seconds: 60,
            max_delay_seconds: 3_600,
        }
    }
}

/// Delay before the next attempt, in seconds.
pub fn next_delay_seconds(policy: &RetryPolicy, attempt: i32) -> i64 {
    let attempt = i64::from(attempt.max(1));
    let base = i64::from(policy.delay_seconds.max(0));
    let max = i64::from(policy.max_delay_seconds.max(0));

    let delay = match policy.strategy {
        RetryStrategy::Fixed => base,
        RetryStrategy::Linear => base.saturating_mul(attempt),
        RetryStrategy::Exponential => {
            // 2^(attempt-1), saturating well before i64 overflow
            let shift = (attempt - 1).min(32) as u32;
            base.saturating_mul(1i64 << shift)
        }
    };

    delay.min(max)
}

/// Wall-clock time of the next attempt.
pub fn next_retry_at(policy: &RetryPolicy, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::seconds(next_delay_seconds(policy, attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy, delay: i32, max: i32) -> RetryPolicy {
        RetryPolicy {
            strategy,
            delay_seconds: delay,
            max_delay_seconds: max,
        }
    }

    #[test]
    fn test_fixed_ignores_attempt() {
        let p = policy(RetryStrategy::Fixed, 60, 3_600);
        assert_eq!(next_delay_seconds(&p, 1), 60);
        assert_eq!(next_delay_seconds(&p, 7), 60);
    }

    #[test]
    fn test_linear_scales_with_attempt() {
        let p = policy(RetryStrategy::Linear, 30, 3_600);
        assert_eq!(next_delay_seconds(&p, 1), 30);
        assert_eq!(next_delay_seconds(&p, 2), 60);
        assert_eq!(next_delay_seconds(&p, 5), 150);
    }

    #[test]
    fn test_exponential_doubles() {
        let p = policy(RetryStrategy::Exponential, 1, 3_600);
        assert_eq!(next_delay_seconds(&p, 1), 1);
        assert_eq!(next_delay_seconds(&p, 2), 2);
        assert_eq!(next_delay_seconds(&p, 3), 4);
        assert_eq!(next_delay_seconds(&p, 4), 8);
    }

    #[test]
    fn test_max_delay_caps() {
        let p = policy(RetryStrategy::Exponential, 60, 300);
        assert_eq!(next_delay_seconds(&p, 1), 60);
        assert_eq!(next_delay_seconds(&p, 2), 120);
        assert_eq!(next_delay_seconds(&p, 3), 240);
        assert_eq!(next_delay_seconds(&p, 4), 300);
        assert_eq!(next_delay_seconds(&p, 20), 300);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(RetryStrategy::Exponential, i32::MAX, i32::MAX);
        assert_eq!(next_delay_seconds(&p, i32::MAX), i64::from(i32::MAX));
    }

    #[test]
    fn test_next_retry_at_offsets_now() {
        let p = policy(RetryStrategy::Fixed, 10, 3_600);
        let now = Utc::now();
        assert_eq!(next_retry_at(&p, 3, now), now + Duration::seconds(10));
    }
}
