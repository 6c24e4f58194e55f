//! Retry policy and recovery configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest extra fraction added to a backoff delay when jitter is on.
const JITTER_FRACTION: f64 = 0.25;

/// Bounded exponential backoff for stages that failed transiently.
///
/// Failures are counted per stage from 1. After the `max_retries`-th
/// consecutive failure the job is abandoned instead of retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling for any single delay, before jitter.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Same delay before every retry, no jitter.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            use_jitter: false,
        }
    }

    /// Whether the stage may run again after its `failures`-th failure.
    pub fn allows_retry_after(&self, failures: u32) -> bool {
        failures < self.max_retries
    }

    /// Wait before the retry that follows the `failures`-th failure:
    /// `initial * multiplier^(failures - 1)`, capped at `max_delay_ms`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let uncapped = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = uncapped.min(self.max_delay_ms as f64).max(0.0) as u64;
        if !self.use_jitter {
            return Duration::from_millis(delay_ms);
        }
        let jitter = (delay_ms as f64 * JITTER_FRACTION * rand::random::<f64>()) as u64;
        Duration::from_millis(delay_ms + jitter)
    }
}

fn default_permanent_exit_codes() -> Vec<i32> {
    vec![2]
}

/// Failure classification and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Treat worker timeouts as transient instead of permanent.
    #[serde(default)]
    pub retry_on_timeout: bool,
    /// Exit codes that mark invalid input (argparse exits with 2).
    #[serde(default = "default_permanent_exit_codes")]
    pub permanent_exit_codes: Vec<i32>,
    /// Running stages older than this are reported by the health check.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_stuck_after_secs() -> u64 {
    600
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_on_timeout: false,
            permanent_exit_codes: default_permanent_exit_codes(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}
