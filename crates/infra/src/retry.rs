//! Retry/backoff policy shared by the broker reconnect loop and command re-dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt-1), capped
    #[default]
    Exponential,
    /// base * attempt, capped
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = never retry)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor in 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-indexed). Attempt 0 is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so that tests stay reproducible.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let spread = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// `attempts` retries already made; is another one allowed?
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(u32::MAX, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn exponential_policy_doubles_up_to_the_cap() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(100));

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::fixed(1, Duration::from_millis(1000)).with_jitter(0.2);
        for attempt in 1..50 {
            let ms = policy.delay_for_attempt(attempt).as_millis();
            assert!((800..=1200).contains(&ms), "attempt {attempt}: {ms}ms");
        }
    }
}
