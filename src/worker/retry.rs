//! Exponential backoff between attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::OrchestratorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            base,
            max,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_backoff_base(),
            config.retry_backoff_max(),
        )
    }

    /// Whether another attempt may start after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Upper bound of the delay after attempt `attempt` (1-based):
    /// `min(max, base * 2^(attempt - 1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay after attempt `attempt`, with equal jitter: half the ceiling
    /// plus a random share of the other half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }

    #[test]
    fn test_ceiling_doubles_until_max() {
        let policy = policy();
        assert_eq!(policy.ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.ceiling(2), Duration::from_secs(1));
        assert_eq!(policy.ceiling(3), Duration::from_secs(2));
        assert_eq!(policy.ceiling(10), Duration::from_secs(30));
        assert_eq!(policy.ceiling(400), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_within_equal_jitter_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..8 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..50 {
                let delay = policy.backoff_with(attempt, &mut rng);
                assert!(delay >= ceiling / 2, "{delay:?} below half of {ceiling:?}");
                assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_allows() {
        let policy = policy();
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_zero_base_means_no_delay() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }
}
