use std::time::Duration;

/// Default number of copy attempts per chunk.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay after the first failed attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded exponential backoff for chunk copies during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first one (always >= 1).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` of 0 is treated as 1.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Retries immediately, `max_attempts` times in total.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff(1), Duration::from_millis(50));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_means_one() {
        let p = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(p.max_attempts, 1);
        assert!(!p.should_retry(1));
    }

    #[test]
    fn should_retry_until_exhausted() {
        let p = RetryPolicy::immediate(3);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert_eq!(p.backoff(2), Duration::ZERO);
    }

    #[test]
    fn max_backoff_never_below_initial() {
        let p = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_millis(10));
        assert_eq!(p.backoff(1), Duration::from_secs(1));
    }
}
