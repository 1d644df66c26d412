//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

/// Exponential backoff with additive uniform jitter.
///
/// The base delay is `factor ^ attempt` seconds; jitter adds a uniform draw
/// from `[0, jitter_ratio * base)` so synchronized callers fan out instead of
/// retrying in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub factor: f64,
    pub jitter_ratio: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            factor: 1.5,
            jitter_ratio: 0.2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .factor
            .powi(attempt.min(i32::MAX as u32) as i32)
            .min(self.max_delay.as_secs_f64());
        let jitter = fastrand::f64() * self.jitter_ratio * base;
        Duration::from_secs_f64((base + jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// Retry budget and backoff for one provider client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Zero-retry policy used by tests and one-shot probes.
    pub fn no_retry() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_grows_by_factor() {
        let policy = BackoffPolicy {
            factor: 1.5,
            jitter_ratio: 0.0,
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay(0), Duration::from_secs_f64(1.0));
        assert_eq!(policy.delay(1), Duration::from_secs_f64(1.5));
        assert_eq!(policy.delay(2), Duration::from_secs_f64(2.25));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = BackoffPolicy::default();
        for attempt in 0..6 {
            let base = 1.5_f64.powi(attempt);
            for _ in 0..20 {
                let delay = policy.delay(attempt as u32).as_secs_f64();
                assert!(delay >= base - 1e-9, "attempt={attempt}, delay={delay}");
                assert!(delay <= base * 1.2 + 1e-9, "attempt={attempt}, delay={delay}");
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            factor: 10.0,
            jitter_ratio: 0.2,
            max_delay: Duration::from_secs(5),
        };
        assert!(policy.delay(9) <= Duration::from_secs(5));
    }
}
