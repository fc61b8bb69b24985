//! Exponential backoff for commit-conflict retries.
//!
//! Conflicts are expected to be rare and short-lived, so the defaults spend
//! the whole retry budget in well under a second.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 10).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 8ms).
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay (default: 250ms).
    pub max_backoff_ms: u64,
    /// Multiplier applied after each attempt (default: 1.5).
    pub backoff_multiplier: f64,
    /// Random jitter as a fraction of the delay, in `[0, 1]` (default: 0.1).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 8,
            max_backoff_ms: 250,
            backoff_multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Starts a fresh retry cycle.
    pub fn init(&self) -> BackoffState {
        BackoffState {
            attempt: 1,
            base_delay_ms: self.initial_backoff_ms as f64,
            config: self.clone(),
        }
    }

    /// Sum of all un-jittered delays a full retry cycle can sleep.
    pub fn total_budget(&self) -> Duration {
        let mut state = self.init();
        let mut total = Duration::ZERO;
        while !state.is_exhausted() {
            total += state.base_delay();
            state.advance();
        }
        total
    }
}

/// Position within one retry cycle.
#[derive(Debug, Clone)]
pub struct BackoffState {
    attempt: u32,
    base_delay_ms: f64,
    config: RetryConfig,
}

impl BackoffState {
    /// 1-based number of the attempt about to run or running.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once no further attempt is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    fn base_delay(&self) -> Duration {
        let capped = self.base_delay_ms.min(self.config.max_backoff_ms as f64);
        Duration::from_micros((capped * 1000.0) as u64)
    }

    /// Delay to sleep before the next attempt, with jitter applied.
    pub fn next_delay(&self) -> Duration {
        let base = self.base_delay();
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Moves to the next attempt and grows the delay.
    pub fn advance(&mut self) {
        self.attempt += 1;
        self.base_delay_ms *= self.config.backoff_multiplier;
    }
}

/// Only commit conflicts are retried; everything else propagates unchanged.
pub fn is_retryable(error: &GraphError) -> bool {
    error.is_commit_conflict()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_backoff_ms, 8);
        assert!(config.total_budget() < Duration::from_secs(1));
        assert!(config.total_budget() > Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_grows_without_jitter() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        let mut state = config.init();
        let mut last = Duration::ZERO;
        while !state.is_exhausted() {
            let delay = state.next_delay();
            assert!(delay > last);
            last = delay;
            state.advance();
        }
        assert_eq!(state.attempt(), 10);
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 150,
            backoff_multiplier: 10.0,
            jitter: 0.0,
            max_attempts: 5,
        };
        let mut state = config.init();
        state.advance();
        state.advance();
        assert_eq!(state.next_delay(), Duration::from_millis(150));
    }

    #[test]
    fn test_jitter_bounded() {
        let config = RetryConfig {
            jitter: 0.5,
            ..Default::default()
        };
        let state = config.init();
        for _ in 0..100 {
            let d = state.next_delay();
            assert!(d >= Duration::from_millis(4) && d <= Duration::from_millis(12));
        }
    }

    #[test]
    fn test_no_retry_exhausted_immediately() {
        assert!(RetryConfig::no_retry().init().is_exhausted());
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&GraphError::TxCommitConflict {
            tx_name: "x".into()
        }));
        assert!(!is_retryable(&GraphError::Timeout { timeout_ms: 1 }));
        assert!(!is_retryable(&GraphError::Disconnected {
            message: "x".into()
        }));
    }
}
