//! Activity retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Retry configuration for an activity
///
/// Attempts are counted per delivery, so `max_attempts = 3` means the
/// activity runs at most three times before the failure becomes terminal.
///
/// # Example
///
/// ```
/// use keel_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert!(policy.has_attempts_remaining(4));
/// assert!(!policy.has_attempts_remaining(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::serde_millis::duration")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "crate::serde_millis::duration")]
    pub max_interval: Duration,

    /// Multiplier applied per retry
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10%
    pub jitter: f64,

    /// Error types that fail immediately
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 5 attempts, 1s initial, 60s cap, 2x, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Fixed intervals, no backoff and no jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor, clamped to 0.0-1.0
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay before attempt number `attempt` (1-based); the first attempt has none
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type may be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if another attempt may follow `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide what happens after `attempt` failed with `error`
    ///
    /// Returns the delay before the next attempt, or `None` when the failure
    /// is terminal.
    pub fn next_retry(&self, attempt: u32, error: &ActivityError) -> Option<Duration> {
        if !error.retryable
            || !self.should_retry(error.error_type.as_deref())
            || !self.has_attempts_remaining(attempt)
        {
            return None;
        }
        Some(self.delay_for_attempt(attempt + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_with_zero_interval() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::ZERO)
            .with_jitter(0.5);

        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2).as_secs_f64();
            assert!((0.9..=1.1).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_next_retry_decisions() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 3)
            .with_non_retryable_error("bad_request");

        let transient = ActivityError::retryable("connection reset");
        assert_eq!(
            policy.next_retry(1, &transient),
            Some(Duration::from_millis(10))
        );
        assert_eq!(policy.next_retry(3, &transient), None);

        let permanent = ActivityError::non_retryable("nope");
        assert_eq!(policy.next_retry(1, &permanent), None);

        let listed = ActivityError::retryable("400").with_type("bad_request");
        assert_eq!(policy.next_retry(1, &listed), None);
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
