//! Retry policy with exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Upper bound of the random extra delay, as a fraction of the computed delay.
const JITTER_FACTOR: f64 = 0.1;

/// How transient store faults are retried.
///
/// A policy with `max_retry_attempts = n` runs an operation at most `n + 1`
/// times. Retry number `k` (1-based) waits `base_delay × 2^(k-1)` with
/// exponential backoff, `base_delay` otherwise. Jitter adds up to 10% on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Double the delay on every further retry.
    pub exponential_backoff: bool,
    /// Add a random 0-10% to every delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay: Duration::from_secs(1),
            exponential_backoff: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter.
    #[must_use]
    pub fn new(max_retry_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Toggles exponential backoff.
    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Toggles jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Maximum number of times an operation runs.
    pub fn max_invocations(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Delay before retry number `retry`, without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        if !self.exponential_backoff || retry <= 1 {
            return self.base_delay;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before retry number `retry` (1-based), jittered when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=JITTER_FACTOR);
        delay.saturating_add(delay.mul_f64(extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter(false);
        let delays: Vec<_> = (1..=4).map(|retry| policy.delay_for(retry)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn constant_delay_without_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250))
            .with_exponential_backoff(false)
            .with_jitter(false);
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[test]
    fn huge_retry_numbers_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1)).with_jitter(false);
        assert_eq!(policy.delay_for(200), Duration::from_secs(u64::from(u32::MAX)));
        assert_eq!(policy.max_invocations(), u32::MAX);
    }
}
