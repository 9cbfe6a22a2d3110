//! Construction-time configuration for [`FairQueue`](super::FairQueue).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::concurrency::ConcurrencyGroupConfig;
use crate::error::QueueError;
use crate::keys::DEFAULT_KEY_PREFIX;
use crate::queue::cooloff::CooloffConfig;
use crate::queue::message::RedriveAttemptPolicy;
use crate::queue::retry::{FixedDelayRetry, RetryStrategy};
use crate::queue::validation::PayloadValidator;
use crate::scheduler::{DrrConfig, FairDequeuingConfig};

/// How many messages a consumer claims from one queue at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    Single,
    /// Up to `max` per claim, further capped by concurrency headroom.
    Batch { max: usize },
}

impl ClaimMode {
    pub fn max_per_claim(&self) -> usize {
        match self {
            ClaimMode::Single => 1,
            ClaimMode::Batch { max } => *max,
        }
    }
}

/// Which algorithm orders queues for the consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerKind {
    FairDequeuing(FairDequeuingConfig),
    Drr(DrrConfig),
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::FairDequeuing(FairDequeuingConfig::default())
    }
}

/// Configuration for a [`FairQueue`](super::FairQueue).
#[derive(Clone)]
pub struct FairQueueConfig {
    /// Prefix of every key this queue touches.
    pub key_prefix: String,
    /// Number of master-index and in-flight shards.
    pub shard_count: u32,
    /// Consumer loops started by `start()`.
    pub consumer_count: usize,
    /// Sleep between polls when a pass found nothing to do.
    pub consumer_interval: Duration,
    /// How long a claim stays valid before the reclaim sweep returns it.
    pub visibility_timeout: Duration,
    pub claim_mode: ClaimMode,
    pub reclaim_interval: Duration,
    /// Expired claims handled per shard per sweep.
    pub reclaim_batch_size: usize,
    pub concurrency_groups: Vec<ConcurrencyGroupConfig>,
    pub retry: Arc<dyn RetryStrategy>,
    /// Move exhausted messages to the tenant's dead-letter queue instead of dropping them.
    pub dead_letter_queue: bool,
    pub redrive_policy: RedriveAttemptPolicy,
    pub cooloff: CooloffConfig,
    pub scheduler: SchedulerKind,
    /// How long `close()` waits for running handlers.
    pub shutdown_timeout: Duration,
    pub validate_on_enqueue: bool,
    pub validator: Option<Arc<dyn PayloadValidator>>,
}

impl fmt::Debug for FairQueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairQueueConfig")
            .field("key_prefix", &self.key_prefix)
            .field("shard_count", &self.shard_count)
            .field("consumer_count", &self.consumer_count)
            .field("consumer_interval", &self.consumer_interval)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("claim_mode", &self.claim_mode)
            .field("reclaim_interval", &self.reclaim_interval)
            .field("reclaim_batch_size", &self.reclaim_batch_size)
            .field("concurrency_groups", &self.concurrency_groups)
            .field("retry", &self.retry)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("redrive_policy", &self.redrive_policy)
            .field("cooloff", &self.cooloff)
            .field("scheduler", &self.scheduler)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("validate_on_enqueue", &self.validate_on_enqueue)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            shard_count: 2,
            consumer_count: 1,
            consumer_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(30),
            claim_mode: ClaimMode::Single,
            reclaim_interval: Duration::from_secs(5),
            reclaim_batch_size: 500,
            concurrency_groups: Vec::new(),
            retry: Arc::new(FixedDelayRetry::default()),
            dead_letter_queue: true,
            redrive_policy: RedriveAttemptPolicy::default(),
            cooloff: CooloffConfig::default(),
            scheduler: SchedulerKind::default(),
            shutdown_timeout: Duration::from_secs(30),
            validate_on_enqueue: false,
            validator: None,
        }
    }
}

impl FairQueueConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_consumer_count(mut self, count: usize) -> Self {
        self.consumer_count = count;
        self
    }

    pub fn with_consumer_interval(mut self, interval: Duration) -> Self {
        self.consumer_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_claim_mode(mut self, mode: ClaimMode) -> Self {
        self.claim_mode = mode;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_concurrency_group(mut self, group: ConcurrencyGroupConfig) -> Self {
        self.concurrency_groups.push(group);
        self
    }

    pub fn with_retry(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    pub fn with_dead_letter_queue(mut self, enabled: bool) -> Self {
        self.dead_letter_queue = enabled;
        self
    }

    pub fn with_redrive_policy(mut self, policy: RedriveAttemptPolicy) -> Self {
        self.redrive_policy = policy;
        self
    }

    pub fn with_cooloff(mut self, cooloff: CooloffConfig) -> Self {
        self.cooloff = cooloff;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates every enqueued payload with `validator`.
    pub fn with_validator(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self.validate_on_enqueue = true;
        self
    }

    /// Checks the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.key_prefix.is_empty() {
            return Err(QueueError::Config("key_prefix must not be empty".into()));
        }
        if self.shard_count == 0 {
            return Err(QueueError::Config("shard_count must be at least 1".into()));
        }
        if self.consumer_count == 0 {
            return Err(QueueError::Config("consumer_count must be at least 1".into()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::Config("visibility_timeout must be positive".into()));
        }
        if self.claim_mode.max_per_claim() == 0 {
            return Err(QueueError::Config("batch claim size must be at least 1".into()));
        }
        if self.validate_on_enqueue && self.validator.is_none() {
            return Err(QueueError::Config(
                "validate_on_enqueue requires a validator".into(),
            ));
        }
        let mut names: Vec<&str> = self
            .concurrency_groups
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(QueueError::Config(
                "concurrency group names must be unique".into(),
            ));
        }
        Ok(())
    }
}
