//! Multi-tenant fair queue.
//!
//! [`FairQueue`] ties the pieces together:
//!
//! - producers call [`FairQueue::enqueue`] / [`FairQueue::enqueue_batch`],
//!   which write the message and register its queue in the shard's master
//!   index;
//! - [`FairQueue::start`] spawns `consumer_count` consumer loops and a
//!   reclaim sweep; consumers ask the scheduler which queues to service,
//!   claim through the visibility manager, reserve concurrency and run the
//!   registered handler;
//! - failed deliveries are retried per the [`RetryStrategy`] and end up in
//!   the tenant's dead-letter queue when retries are exhausted.
//!
//! # Example
//!
//! ```ignore
//! use fairq::queue::{EnqueueOptions, FairQueue, FairQueueConfig, MessageContext};
//!
//! let mut queue = FairQueue::connect("redis://127.0.0.1:6379", FairQueueConfig::default()).await?;
//! queue.on_message(|ctx: MessageContext| async move {
//!     println!("{}", ctx.message().payload);
//!     Ok(())
//! });
//! queue.start().await?;
//! queue
//!     .enqueue(EnqueueOptions::new("org:acme:env:prod:queue:emails", "acme", json!({"to": "a@b.c"})))
//!     .await?;
//! ```

pub mod config;
mod consumer;
pub mod cooloff;
pub mod handler;
pub mod message;
pub mod retry;
pub mod validation;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::concurrency::ConcurrencyManager;
use crate::error::QueueError;
use crate::keys::{parse_queue_id, DefaultKeyProducer, KeyProducer};
use crate::metrics::{FailureOutcome, MetricsCollector};
use crate::scheduler::{DrrScheduler, FairDequeuingStrategy, QueueScheduler, RedisSchedulerContext};
use crate::store::{connect, now_ms};
use crate::visibility::{ReleaseRequest, VisibilityManager};

use consumer::Consumer;

pub use config::{ClaimMode, FairQueueConfig, SchedulerKind};
pub use cooloff::{CooloffConfig, CooloffTracker};
pub use handler::{MessageContext, MessageHandler};
pub use message::{
    BatchEnqueueOptions, BatchMessage, DeadLetterMessage, EnqueueOptions, MessageMetadata,
    QueueDescriptor, RedriveAttemptPolicy, StoredMessage,
};
pub use retry::{ExponentialBackoffRetry, FixedDelayRetry, NoRetry, RetryStrategy};
pub use validation::{FnValidator, PayloadValidator, SchemaValidator};

/// Sizes of in-process caches, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSizes {
    /// Entries held by the scheduler (snapshots or deficits).
    pub scheduler: usize,
    /// Cooloff entries summed over consumers.
    pub cooloff: usize,
}

/// State shared by the facade, the consumer loops and handler contexts.
pub(crate) struct QueueCore {
    pub(crate) config: FairQueueConfig,
    pub(crate) keys: Arc<dyn KeyProducer>,
    pub(crate) visibility: VisibilityManager,
    pub(crate) concurrency: Arc<ConcurrencyManager>,
    pub(crate) scheduler: Arc<dyn QueueScheduler>,
    pub(crate) scheduler_ctx: RedisSchedulerContext,
    pub(crate) metrics: MetricsCollector,
}

impl QueueCore {
    /// Removes a processed message and drops its reservations.
    pub(crate) async fn complete_message(
        &self,
        message: &StoredMessage,
        queue: &QueueDescriptor,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        let completed = self.visibility.complete(&message.id, &message.queue_id).await;
        let released = self.concurrency.release(queue, &message.id).await;
        completed?;
        released?;

        self.metrics.record_completed(&message.tenant_id, elapsed);
        debug!(
            message_id = %message.id,
            queue_id = %message.queue_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Message completed"
        );
        Ok(())
    }

    /// Retries, dead-letters or drops a failed message and drops its
    /// reservations whatever the outcome.
    pub(crate) async fn fail_message(
        &self,
        message: &StoredMessage,
        queue: &QueueDescriptor,
        reason: &str,
        elapsed: Duration,
    ) -> Result<FailureOutcome, QueueError> {
        let outcome = self.route_failure(message, reason).await;
        let released = self.concurrency.release(queue, &message.id).await;
        let outcome = outcome?;
        released?;

        self.metrics
            .record_failed(&message.tenant_id, outcome, elapsed);
        Ok(outcome)
    }

    async fn route_failure(
        &self,
        message: &StoredMessage,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        if let Some(delay) = self.config.retry.next_delay(message.attempt) {
            let retry = message.next_attempt(now_ms() + delay.as_millis() as i64);
            warn!(
                message_id = %message.id,
                queue_id = %message.queue_id,
                attempt = message.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Message failed, scheduling retry"
            );
            self.visibility
                .release_batch(&message.queue_id, &[ReleaseRequest::rescheduled(retry)])
                .await?;
            return Ok(FailureOutcome::Retried);
        }

        if self.config.dead_letter_queue {
            warn!(
                message_id = %message.id,
                queue_id = %message.queue_id,
                tenant_id = %message.tenant_id,
                attempts = message.attempt,
                error = %reason,
                "Retries exhausted, moving message to dead-letter queue"
            );
            self.visibility.move_to_dead_letter(message, reason).await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        error!(
            message_id = %message.id,
            queue_id = %message.queue_id,
            attempts = message.attempt,
            error = %reason,
            "Retries exhausted, dropping message"
        );
        self.visibility
            .complete(&message.id, &message.queue_id)
            .await?;
        Ok(FailureOutcome::Dropped)
    }
}

/// Redis-backed fair queue with consumer loops.
pub struct FairQueue {
    core: Arc<QueueCore>,
    handler: Option<Arc<dyn MessageHandler>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    loop_handles: Vec<JoinHandle<()>>,
    cooloff_sizes: Vec<Arc<AtomicUsize>>,
    is_running: AtomicBool,
}

impl FairQueue {
    /// Connects to Redis and builds a queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if Redis is unreachable and
    /// `QueueError::Config` if the configuration is invalid.
    pub async fn connect(redis_url: &str, config: FairQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let redis = connect(redis_url).await?;
        Self::new(redis, config)
    }

    /// Builds a queue over an existing connection with the default key layout.
    pub fn new(redis: ConnectionManager, config: FairQueueConfig) -> Result<Self, QueueError> {
        let keys: Arc<dyn KeyProducer> = Arc::new(DefaultKeyProducer::new(config.key_prefix.clone()));
        Self::with_key_producer(redis, config, keys)
    }

    /// Builds a queue with a custom key layout.
    pub fn with_key_producer(
        redis: ConnectionManager,
        config: FairQueueConfig,
        keys: Arc<dyn KeyProducer>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let visibility = VisibilityManager::new(redis.clone(), Arc::clone(&keys), config.shard_count)
            .with_reclaim_batch_size(config.reclaim_batch_size);
        let concurrency = Arc::new(ConcurrencyManager::new(
            redis.clone(),
            Arc::clone(&keys),
            config.concurrency_groups.clone(),
        ));
        let scheduler: Arc<dyn QueueScheduler> = match &config.scheduler {
            SchedulerKind::FairDequeuing(c) => Arc::new(FairDequeuingStrategy::new(c.clone())),
            SchedulerKind::Drr(c) => Arc::new(DrrScheduler::new(c.clone())),
        };
        let scheduler_ctx = RedisSchedulerContext::new(redis, Arc::clone(&concurrency));

        let core = QueueCore {
            config,
            keys,
            visibility,
            concurrency,
            scheduler,
            scheduler_ctx,
            metrics: MetricsCollector::new(),
        };

        Ok(Self {
            core: Arc::new(core),
            handler: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            loop_handles: Vec::new(),
            cooloff_sizes: Vec::new(),
            is_running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &FairQueueConfig {
        &self.core.config
    }

    pub fn keys(&self) -> &Arc<dyn KeyProducer> {
        &self.core.keys
    }

    pub fn visibility(&self) -> &VisibilityManager {
        &self.core.visibility
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.core.concurrency
    }

    /// Builds a queue id from its parts with this queue's key producer.
    pub fn queue_id(&self, org_id: &str, env_id: &str, queue_name: &str) -> String {
        self.core.keys.queue_id(org_id, env_id, queue_name)
    }

    /// Enqueues one message and returns its id.
    ///
    /// # Errors
    ///
    /// `InvalidQueueId` for a malformed queue id, `Validation` when the
    /// payload is rejected (nothing is stored), or a store error.
    pub async fn enqueue(&self, options: EnqueueOptions) -> Result<String, QueueError> {
        self.check_queue_id(&options.queue_id)?;
        self.validate_payload(&options.payload)?;

        let tenant_id = self.resolve_tenant(&options.queue_id, options.tenant_id);
        let ready_at = options
            .available_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(now_ms);
        let message = StoredMessage::new(&options.queue_id, &tenant_id, options.payload, ready_at)
            .with_metadata(options.metadata);

        self.core
            .visibility
            .enqueue(&options.queue_id, std::slice::from_ref(&message))
            .await?;

        self.core.metrics.record_enqueued(&tenant_id, 1);
        debug!(
            message_id = %message.id,
            queue_id = %message.queue_id,
            ready_at = message.timestamp,
            "Message enqueued"
        );
        Ok(message.id)
    }

    /// Enqueues messages into one queue atomically and returns their ids in order.
    ///
    /// Every payload is validated first; one rejection aborts the batch.
    pub async fn enqueue_batch(
        &self,
        options: BatchEnqueueOptions,
    ) -> Result<Vec<String>, QueueError> {
        self.check_queue_id(&options.queue_id)?;
        if options.messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut errors = Vec::new();
        for (index, message) in options.messages.iter().enumerate() {
            if let Err(QueueError::Validation { errors: found }) =
                self.validate_payload(&message.payload)
            {
                errors.extend(found.into_iter().map(|e| format!("message {}: {}", index, e)));
            }
        }
        if !errors.is_empty() {
            return Err(QueueError::Validation { errors });
        }

        let tenant_id = self.resolve_tenant(&options.queue_id, options.tenant_id);
        let now = now_ms();
        let messages: Vec<StoredMessage> = options
            .messages
            .into_iter()
            .map(|m| {
                let ready_at = m.available_at.map(|at| at.timestamp_millis()).unwrap_or(now);
                StoredMessage::new(&options.queue_id, &tenant_id, m.payload, ready_at)
                    .with_metadata(m.metadata)
            })
            .collect();

        self.core
            .visibility
            .enqueue(&options.queue_id, &messages)
            .await?;

        self.core.metrics.record_enqueued(&tenant_id, messages.len());
        debug!(
            queue_id = %options.queue_id,
            count = messages.len(),
            "Batch enqueued"
        );
        Ok(messages.into_iter().map(|m| m.id).collect())
    }

    /// Registers the handler, replacing any previous one.
    pub fn on_message(&mut self, handler: impl MessageHandler) {
        self.handler = Some(Arc::new(handler));
    }

    /// Starts the consumer loops and the reclaim sweep.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started twice, `NoHandler` without a handler.
    pub async fn start(&mut self) -> Result<(), QueueError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }
        let Some(handler) = self.handler.clone() else {
            return Err(QueueError::NoHandler);
        };

        self.shutdown = CancellationToken::new();
        self.tracker = TaskTracker::new();
        self.cooloff_sizes.clear();

        for index in 0..self.core.config.consumer_count {
            let cooloff_size = Arc::new(AtomicUsize::new(0));
            self.cooloff_sizes.push(Arc::clone(&cooloff_size));
            let consumer = Consumer::new(
                index,
                Arc::clone(&self.core),
                Arc::clone(&handler),
                self.tracker.clone(),
                self.shutdown.clone(),
                cooloff_size,
            );
            self.loop_handles.push(tokio::spawn(consumer.run()));
        }

        let core = Arc::clone(&self.core);
        let shutdown = self.shutdown.clone();
        self.loop_handles
            .push(tokio::spawn(consumer::run_reclaim_sweep(core, shutdown)));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            consumers = self.core.config.consumer_count,
            shards = self.core.config.shard_count,
            "Fair queue started"
        );
        Ok(())
    }

    /// Stops claiming, then waits up to `shutdown_timeout` for running handlers.
    ///
    /// Handlers still running at the timeout keep their claims; the reclaim
    /// sweep of another instance returns those messages.
    pub async fn close(&mut self) -> Result<(), QueueError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(QueueError::NotRunning);
        }

        info!("Initiating fair queue shutdown");
        self.shutdown.cancel();

        for handle in self.loop_handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer task panicked during shutdown");
            }
        }

        self.tracker.close();
        let timeout = self.core.config.shutdown_timeout;
        let result = tokio::time::timeout(timeout, self.tracker.wait()).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Fair queue shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    running = self.tracker.len(),
                    "Handlers still running at shutdown timeout"
                );
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Messages (ready or delayed) waiting in a queue.
    pub async fn get_queue_length(&self, queue_id: &str) -> Result<u64, QueueError> {
        self.core.visibility.queue_length(queue_id).await
    }

    /// Queues with pending messages across all shards.
    pub async fn get_total_queue_count(&self) -> Result<u64, QueueError> {
        self.core.visibility.total_queue_count().await
    }

    /// Claimed, unsettled messages across all shards.
    pub async fn get_total_inflight_count(&self) -> Result<u64, QueueError> {
        self.core.visibility.total_inflight_count().await
    }

    /// Oldest-first page of a tenant's dead letters.
    pub async fn get_dead_letter_messages(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, QueueError> {
        self.core
            .visibility
            .dead_letter_messages(tenant_id, limit)
            .await
    }

    pub async fn get_dead_letter_queue_length(&self, tenant_id: &str) -> Result<u64, QueueError> {
        self.core.visibility.dead_letter_queue_length(tenant_id).await
    }

    /// Moves a dead letter back into its queue using the configured attempt policy.
    ///
    /// Returns false if the tenant has no dead letter with that id.
    pub async fn redrive_message(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<bool, QueueError> {
        let redriven = self
            .core
            .visibility
            .redrive_message(tenant_id, message_id, self.core.config.redrive_policy)
            .await?;
        if redriven {
            info!(tenant_id = %tenant_id, message_id = %message_id, "Dead letter redriven");
        }
        Ok(redriven)
    }

    pub fn get_cache_sizes(&self) -> CacheSizes {
        CacheSizes {
            scheduler: self.core.scheduler.cache_size(),
            cooloff: self
                .cooloff_sizes
                .iter()
                .map(|size| size.load(Ordering::Relaxed))
                .sum(),
        }
    }

    /// Runs one reclaim pass over every shard, outside the background sweep.
    pub async fn reclaim_now(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for shard in 0..self.core.visibility.shard_count() {
            total += consumer::reclaim_shard(&self.core, shard).await?;
        }
        Ok(total)
    }

    fn check_queue_id(&self, queue_id: &str) -> Result<(), QueueError> {
        if parse_queue_id(queue_id).is_none() {
            return Err(QueueError::InvalidQueueId(queue_id.to_string()));
        }
        Ok(())
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), QueueError> {
        if !self.core.config.validate_on_enqueue {
            return Ok(());
        }
        let Some(validator) = &self.core.config.validator else {
            return Ok(());
        };
        validator
            .validate(payload)
            .map_err(|errors| QueueError::Validation { errors })
    }

    /// Empty tenant ids fall back to the queue's org.
    fn resolve_tenant(&self, queue_id: &str, tenant_id: String) -> String {
        if !tenant_id.is_empty() {
            return tenant_id;
        }
        self.core
            .keys
            .tenant_id_from_queue(queue_id)
            .unwrap_or_default()
    }
}

impl Drop for FairQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
