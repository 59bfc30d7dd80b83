//! Classifies errors as retriable vs terminal and computes
//! exponential-backoff-with-jitter delays.

use crate::error::CoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: 2.0,
            max_attempts: 3,
        }
    }
}

/// Per-chunk retry bookkeeping. Reset when the chunk commits; retained
/// across pause/resume since those do not throw away progress.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
}

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempts remaining count starting at 1 for the first try. Returns
    /// `None` once `max_attempts` is reached or the error is terminal.
    pub fn next_delay(&self, error: &CoreError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if attempt >= self.config.max_attempts {
            return None;
        }

        let backoff_factor = self.config.backoff.powi(attempt as i32 - 1);
        let base = self.config.base_delay.as_secs_f64() * backoff_factor;
        let jitter = rand::thread_rng().gen_range(0.85..=1.15);
        let delay_secs = (base * jitter).min(self.config.max_delay.as_secs_f64());

        Some(Duration::from_secs_f64(delay_secs.max(0.0)))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error() -> CoreError {
        CoreError::ServerTransient {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn terminal_errors_never_retry() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let err = CoreError::ServerPermanent {
            status: 404,
            message: "not found".into(),
        };
        assert!(policy.next_delay(&err, 1).is_none());
    }

    #[test]
    fn respects_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            ..RetryConfig::default()
        });
        assert!(policy.next_delay(&server_error(), 1).is_some());
        assert!(policy.next_delay(&server_error(), 2).is_none());
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff: 10.0,
            max_attempts: 10,
        });
        for attempt in 1..9 {
            if let Some(delay) = policy.next_delay(&server_error(), attempt) {
                assert!(delay <= Duration::from_secs(5));
            }
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig::default());
        for _ in 0..200 {
            let delay = policy.next_delay(&server_error(), 1).unwrap();
            assert!(delay.as_secs_f64() >= 1.0 * 0.85 - 1e-9);
            assert!(delay.as_secs_f64() <= 1.0 * 1.15 + 1e-9);
        }
    }
}
