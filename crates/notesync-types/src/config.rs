//! Configuration types for notesync
//!
//! This module provides type-safe request and concurrency settings with
//! validation and serialization support.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limit on the number of concurrently outstanding remote requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct ConcurrencyLimit(usize);

impl ConcurrencyLimit {
    /// Minimum limit
    pub const MIN: usize = 1;
    /// Maximum limit
    pub const MAX: usize = 1024;
    /// Default limit
    pub const DEFAULT: usize = 100;

    /// Create a new concurrency limit with validation
    pub fn new(limit: usize) -> Result<Self, String> {
        if limit < Self::MIN {
            Err(format!(
                "Concurrency limit {} is below minimum {}",
                limit,
                Self::MIN
            ))
        } else if limit > Self::MAX {
            Err(format!(
                "Concurrency limit {} exceeds maximum {}",
                limit,
                Self::MAX
            ))
        } else {
            Ok(Self(limit))
        }
    }

    /// Get the limit value
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for ConcurrencyLimit {
    type Error = String;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConcurrencyLimit> for usize {
    fn from(limit: ConcurrencyLimit) -> Self {
        limit.0
    }
}

/// Retry policy handed to the remote client with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, String> {
        if backoff_multiplier <= 1.0 {
            return Err("Backoff multiplier must be greater than 1.0".to_string());
        }
        if initial_delay > max_delay {
            return Err("Initial delay cannot be greater than max delay".to_string());
        }
        Ok(Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        })
    }

    /// Calculate the delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Timeouts applied to remote requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout of a single request
    pub request_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(100, true)]
    #[case(1024, true)]
    #[case(1025, false)]
    fn test_concurrency_limit_validation(#[case] limit: usize, #[case] valid: bool) {
        assert_eq!(ConcurrencyLimit::new(limit).is_ok(), valid);
    }

    #[test]
    fn test_concurrency_limit_deserialization_validates() {
        let limit: ConcurrencyLimit = serde_json::from_str("8").unwrap();
        assert_eq!(limit.get(), 8);
        assert!(serde_json::from_str::<ConcurrencyLimit>("0").is_err());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = RetryConfig::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
        )
        .unwrap();

        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_rejects_non_growing_backoff() {
        assert!(RetryConfig::new(3, Duration::from_millis(1), Duration::from_secs(1), 1.0).is_err());
        assert!(RetryConfig::new(3, Duration::from_secs(2), Duration::from_secs(1), 2.0).is_err());
    }
}
