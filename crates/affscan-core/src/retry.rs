//! Bounded retry policy for chain calls.
//!
//! Transient network errors back off exponentially; rate limits sleep for the
//! provider-suggested delay. Both budgets are per operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Retry configuration (deserialised from the `retry` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after a transient error (not counting the first try).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Caps exponential growth.
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Retries after a rate-limit response.
    pub max_rate_limit_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            max_rate_limit_retries: 5,
        }
    }
}

/// Stateless policy. Computes the delay for the n-th retry of an error.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Exponential delay before the `attempt`-th retry (1-based), or `None`
    /// once `max_retries` is exhausted.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Delay before retrying after `err`, given how many times each kind has
    /// already been retried. `None` means give up.
    pub fn delay_for(&self, err: &ScanError, transient_attempt: u32, rate_limit_attempt: u32) -> Option<Duration> {
        match err {
            ScanError::RateLimited { retry_after } => {
                (rate_limit_attempt <= self.config.max_rate_limit_retries).then_some(*retry_after)
            }
            ScanError::TransientNetwork(_) => self.backoff(transient_attempt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            max_rate_limit_retries: 2,
        })
    }

    #[test]
    fn exponential_backoff() {
        let p = policy(3);
        assert_eq!(p.backoff(1).unwrap().as_millis(), 100);
        assert_eq!(p.backoff(2).unwrap().as_millis(), 200);
        assert_eq!(p.backoff(3).unwrap().as_millis(), 400);
        assert!(p.backoff(4).is_none());
    }

    #[test]
    fn backoff_capped_at_max() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 10.0,
            max_rate_limit_retries: 0,
        });
        assert_eq!(p.backoff(5).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rate_limit_uses_suggested_delay_until_budget_exhausted() {
        let p = policy(3);
        let err = ScanError::RateLimited { retry_after: Duration::from_millis(1234) };
        assert_eq!(p.delay_for(&err, 0, 1), Some(Duration::from_millis(1234)));
        assert_eq!(p.delay_for(&err, 0, 2), Some(Duration::from_millis(1234)));
        assert_eq!(p.delay_for(&err, 0, 3), None);
    }

    #[test]
    fn non_retryable_errors_give_up() {
        let p = policy(3);
        assert!(p.delay_for(&ScanError::FatalConfig("x".into()), 1, 0).is_none());
        assert!(p.delay_for(&ScanError::Storage("x".into()), 1, 0).is_none());
    }
}
