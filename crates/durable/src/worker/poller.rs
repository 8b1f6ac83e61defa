//! Poll loop timing: long-poll length and backoff after store errors

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// How long one poll waits for a task before returning empty
    #[serde(with = "crate::serde_millis::duration")]
    pub poll_timeout: Duration,

    /// First delay after a failed poll
    #[serde(with = "crate::serde_millis::duration")]
    pub min_backoff: Duration,

    /// Upper bound for the delay between failed polls
    #[serde(with = "crate::serde_millis::duration")]
    pub max_backoff: Duration,

    /// Backoff multiplier per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_min_backoff(mut self, backoff: Duration) -> Self {
        self.min_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set backoff multiplier (at least 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Exponential backoff between failed polls
///
/// Grows on each consecutive failure and resets on the next successful poll.
#[derive(Debug, Clone)]
pub struct ErrorBackoff {
    config: PollerConfig,
    current: Option<Duration>,
}

impl ErrorBackoff {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Delay before the next poll after a failure
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.config.min_backoff,
            Some(current) => Duration::from_secs_f64(
                current.as_secs_f64() * self.config.backoff_multiplier,
            ),
        }
        .min(self.config.max_backoff);
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.min_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config = PollerConfig::default().with_poll_timeout(Duration::from_secs(2));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_timeout"], 2000);

        let parsed: PollerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = PollerConfig::default()
            .with_min_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut backoff = ErrorBackoff::new(config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
