//! Retry backoff policy.
//!
//! Exponential backoff with bounded jitter:
//! `delay = min(base * 2^attempt, ceiling) + jitter`, where jitter is drawn
//! from `[0, base / 2)` and the result never exceeds `ceiling`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters for one class of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Hard cap on any computed delay.
    pub ceiling: Duration,
    /// Add random jitter to spread retries of jobs that failed together.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Jittered policy.
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            jitter: true,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows `attempt` failed attempts (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.exponential(attempt);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.ceiling.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.ceiling)
    }

    /// The un-jittered component, saturating at the ceiling.
    fn exponential(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_without_jitter() {
        // 1s, 2s, 4s, 8s, 16s, 30s (max)
        let policy = BackoffPolicy::default().with_jitter(false);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(30)); // Capped at ceiling
        assert_eq!(policy.delay(64), Duration::from_secs(30)); // Shift overflow saturates
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 0..8 {
            let floor = policy.with_jitter(false).delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= floor);
                assert!(delay < floor + Duration::from_millis(500));
                assert!(delay <= policy.ceiling);
            }
        }
    }

    #[test]
    fn test_ceiling_never_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.ceiling, Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(10));
    }
}
