//! Retry strategies for failed deliveries.

use std::fmt;
use std::time::Duration;

/// Default maximum number of delivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Decides whether and when a failed message is delivered again.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Delay before the next delivery after attempt `attempt` (1-based)
    /// failed, or `None` once the attempt budget is spent.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total deliveries allowed, including the first.
    fn max_attempts(&self) -> u32;
}

/// Retries after the same delay every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelayRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedDelayRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for FixedDelayRetry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_secs(1))
    }
}

impl RetryStrategy for FixedDelayRetry {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Doubles (by `factor`) the delay after every failure, up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoffRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl ExponentialBackoffRetry {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl RetryStrategy for ExponentialBackoffRetry {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Some(Duration::from_millis(capped as u64))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Never retries: the first failure is final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}
