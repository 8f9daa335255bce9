//! Reset ceiling and backoff schedule for failed permission sync jobs.

use std::time::Duration;

/// Exponential backoff with a reset ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// A job is reset at most this many times before failing for good.
    pub max_resets: i64,
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth.
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before a job that has now failed `num_failures` times may be
    /// leased again: `initial * multiplier^(num_failures - 1)`, capped.
    pub fn backoff(&self, num_failures: i64) -> Duration {
        let exponent = (num_failures.max(1) - 1).min(i32::MAX as i64) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_secs(backoff.min(self.max_backoff_secs as f64) as u64)
    }

    /// Whether a job that has failed `num_failures` times may be reset again.
    pub fn can_reset(&self, num_failures: i64) -> bool {
        num_failures < self.max_resets
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_resets: 5,
            initial_backoff_secs: 60,
            max_backoff_secs: 6 * 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_resets, 5);
        assert_eq!(policy.initial_backoff_secs, 60);
        assert_eq!(policy.max_backoff_secs, 21600);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_resets: 5,
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(4), Duration::from_secs(480));
    }

    #[test]
    fn test_backoff_capping() {
        let policy = RetryPolicy {
            max_resets: 10,
            initial_backoff_secs: 60,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        // 60 * 2^3 = 480 -> capped
        assert_eq!(policy.backoff(4), Duration::from_secs(300));
        assert_eq!(policy.backoff(1_000), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_failures_uses_initial_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), policy.backoff(1));
    }

    #[test]
    fn test_can_reset_until_ceiling() {
        let policy = RetryPolicy {
            max_resets: 3,
            ..Default::default()
        };

        assert!(policy.can_reset(0));
        assert!(policy.can_reset(2));
        assert!(!policy.can_reset(3));
        assert!(!policy.can_reset(10));
    }

    #[test]
    fn test_multiplier_of_one() {
        let policy = RetryPolicy {
            max_resets: 5,
            initial_backoff_secs: 100,
            max_backoff_secs: 1000,
            backoff_multiplier: 1.0,
        };

        assert_eq!(policy.backoff(1), Duration::from_secs(100));
        assert_eq!(policy.backoff(10), Duration::from_secs(100));
    }
}
