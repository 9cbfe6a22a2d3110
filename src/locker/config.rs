//! Lock acquisition retry schedule and locker settings.

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::keys::DEFAULT_KEY_PREFIX;

/// Backoff schedule for acquiring a contended lock.
///
/// Delay before retry `i` (0-based) is
/// `min(base_delay * backoff_multiplier^i, max_delay)`, randomized by
/// `± jitter_factor`. Acquisition gives up after `max_retries` retries or
/// once the next sleep would push the total wait past `max_total_wait_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockRetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub max_total_wait_time: Duration,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 1.5,
            jitter_factor: 0.1,
            max_total_wait_time: Duration::from_millis(30000),
        }
    }
}

impl LockRetryConfig {
    /// Delay before retry `retry` without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let millis = self.base_delay.as_millis() as f64
            * self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry `retry` with jitter applied.
    pub fn delay_for<R: RngExt>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(retry);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.random_range(-jitter..=jitter);
        Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
    }

    /// Applies the set fields of `overrides` over this schedule.
    pub fn merged(mut self, overrides: &LockRetryOverrides) -> Self {
        if let Some(v) = overrides.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = overrides.base_delay {
            self.base_delay = v;
        }
        if let Some(v) = overrides.max_delay {
            self.max_delay = v;
        }
        if let Some(v) = overrides.backoff_multiplier {
            self.backoff_multiplier = v;
        }
        if let Some(v) = overrides.jitter_factor {
            self.jitter_factor = v;
        }
        if let Some(v) = overrides.max_total_wait_time {
            self.max_total_wait_time = v;
        }
        self
    }
}

/// Partial retry settings; unset fields keep their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_factor: Option<f64>,
    pub max_total_wait_time: Option<Duration>,
}

/// Configuration for a [`RunLocker`](super::RunLocker).
#[derive(Debug, Clone, PartialEq)]
pub struct RunLockerConfig {
    pub key_prefix: String,
    pub retry: LockRetryConfig,
    /// Fraction of the lease assumed lost to clock drift between nodes.
    pub drift_factor: f64,
    /// Renew held leases in the background while the callback runs.
    pub auto_extend: bool,
}

impl Default for RunLockerConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: LockRetryConfig::default(),
            drift_factor: 0.01,
            auto_extend: true,
        }
    }
}

impl RunLockerConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: LockRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Merges `overrides` over the current retry schedule.
    pub fn with_retry_overrides(mut self, overrides: LockRetryOverrides) -> Self {
        self.retry = self.retry.merged(&overrides);
        self
    }

    pub fn with_auto_extend(mut self, enabled: bool) -> Self {
        self.auto_extend = enabled;
        self
    }
}
