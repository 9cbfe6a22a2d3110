//! Claim, heartbeat, release and reclaim of in-flight messages.
//!
//! This module owns the state machine a message goes through once it has been
//! enqueued:
//!
//! ```text
//!   queue set ──claim──▶ in-flight set ──complete──▶ (gone)
//!       ▲                    │  │
//!       └──release/reclaim───┘  └──dead letter──▶ DLQ ──redrive──▶ queue set
//! ```
//!
//! # Reliability
//!
//! Each arrow is a single Lua script. Release, reclaim and dead-lettering
//! only act on a message that is still in the in-flight set, so two parties
//! racing (a slow consumer completing while the reclaim sweep returns the
//! message) can never both succeed.
//!
//! Released and reclaimed messages go back at their own `timestamp`, not at
//! the claim deadline or "now", so they keep their place in age ordering.

mod scripts;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::keys::{inflight_member, parse_inflight_member, shard_for_queue, KeyProducer};
use crate::queue::message::{
    DeadLetterMessage, MessageMetadata, RedriveAttemptPolicy, StoredMessage,
};
use crate::store::now_ms;

/// Default number of expired claims handled per shard per reclaim pass.
const DEFAULT_RECLAIM_BATCH_SIZE: usize = 500;

/// Keys of the structures backing one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue_key: String,
    pub items_key: String,
    pub master_key: String,
}

impl QueueKeys {
    pub fn resolve(keys: &dyn KeyProducer, queue_id: &str, shard_count: u32) -> Self {
        Self {
            queue_key: keys.queue_key(queue_id),
            items_key: keys.queue_items_key(queue_id),
            master_key: keys.master_queue_key(shard_for_queue(queue_id, shard_count)),
        }
    }
}

/// A message claimed from a queue, with the deadline of its claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedMessage {
    pub message: StoredMessage,
    pub deadline_ms: i64,
}

/// A message returned to its queue by the reclaim sweep.
///
/// Carries enough information to release concurrency reservations taken when
/// the message was claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedMessageInfo {
    pub message_id: String,
    pub queue_id: String,
    pub tenant_id: String,
    pub metadata: MessageMetadata,
}

/// A message to put back into its queue.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub message_id: String,
    /// Score to restore: the message's own ready-at time.
    pub score: i64,
    /// Replacement body (e.g. with an incremented attempt); `None` keeps the stored one.
    pub updated: Option<StoredMessage>,
}

impl ReleaseRequest {
    /// Release at the message's original timestamp, body untouched.
    pub fn original(message: &StoredMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            score: message.timestamp,
            updated: None,
        }
    }

    /// Release as the given (rescheduled) message.
    pub fn rescheduled(message: StoredMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            score: message.timestamp,
            updated: Some(message),
        }
    }
}

/// Manages the visibility of claimed messages.
pub struct VisibilityManager {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: Arc<dyn KeyProducer>,
    shard_count: u32,
    reclaim_batch_size: usize,
    enqueue_script: Script,
    claim_script: Script,
    heartbeat_script: Script,
    complete_script: Script,
    release_script: Script,
    scan_expired_script: Script,
    dead_letter_script: Script,
    redrive_script: Script,
}

impl VisibilityManager {
    pub fn new(redis: ConnectionManager, keys: Arc<dyn KeyProducer>, shard_count: u32) -> Self {
        Self {
            redis,
            keys,
            shard_count: shard_count.max(1),
            reclaim_batch_size: DEFAULT_RECLAIM_BATCH_SIZE,
            enqueue_script: Script::new(scripts::ENQUEUE),
            claim_script: Script::new(scripts::CLAIM),
            heartbeat_script: Script::new(scripts::HEARTBEAT),
            complete_script: Script::new(scripts::COMPLETE),
            release_script: Script::new(scripts::RELEASE),
            scan_expired_script: Script::new(scripts::SCAN_EXPIRED),
            dead_letter_script: Script::new(scripts::DEAD_LETTER),
            redrive_script: Script::new(scripts::REDRIVE),
        }
    }

    /// Sets how many expired claims a reclaim pass handles per shard.
    pub fn with_reclaim_batch_size(mut self, size: usize) -> Self {
        self.reclaim_batch_size = size.max(1);
        self
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn keys(&self) -> &Arc<dyn KeyProducer> {
        &self.keys
    }

    /// Keys backing a queue.
    pub fn queue_keys(&self, queue_id: &str) -> QueueKeys {
        QueueKeys::resolve(self.keys.as_ref(), queue_id, self.shard_count)
    }

    fn shard_of(&self, queue_id: &str) -> u32 {
        shard_for_queue(queue_id, self.shard_count)
    }

    /// Writes messages into a queue and registers the queue in its master index.
    ///
    /// All messages must belong to `queue_id`. The write is one script, so a
    /// batch is stored entirely or not at all.
    pub async fn enqueue(
        &self,
        queue_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }

        let queue_keys = self.queue_keys(queue_id);
        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(&queue_keys.queue_key)
            .key(&queue_keys.items_key)
            .key(&queue_keys.master_key)
            .arg(queue_id);
        for message in messages {
            invocation
                .arg(&message.id)
                .arg(message.timestamp)
                .arg(message.to_json()?);
        }

        let mut conn = self.redis.clone();
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Claims the oldest ready message of a queue.
    ///
    /// Returns `None` when the queue is empty or its head is not ready yet.
    pub async fn claim(
        &self,
        queue_id: &str,
        consumer_id: &str,
        timeout_ms: u64,
    ) -> Result<Option<ClaimedMessage>, QueueError> {
        Ok(self
            .claim_batch(queue_id, consumer_id, timeout_ms, 1)
            .await?
            .into_iter()
            .next())
    }

    /// Claims up to `max_count` ready messages, oldest first, in one script.
    ///
    /// Bodies that fail to deserialize are logged, dropped from in-flight and
    /// from the items hash, and left out of the result.
    pub async fn claim_batch(
        &self,
        queue_id: &str,
        consumer_id: &str,
        timeout_ms: u64,
        max_count: usize,
    ) -> Result<Vec<ClaimedMessage>, QueueError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let shard = self.shard_of(queue_id);
        let queue_keys = self.queue_keys(queue_id);
        let now = now_ms();
        let deadline_ms = now + timeout_ms as i64;

        let mut conn = self.redis.clone();
        let raw: Vec<String> = self
            .claim_script
            .key(&queue_keys.queue_key)
            .key(&queue_keys.items_key)
            .key(&queue_keys.master_key)
            .key(self.keys.inflight_key(shard))
            .key(self.keys.inflight_data_key(shard))
            .arg(queue_id)
            .arg(now)
            .arg(deadline_ms)
            .arg(max_count)
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            let (message_id, data) = (&pair[0], &pair[1]);
            if data.is_empty() {
                warn!(
                    consumer_id = %consumer_id,
                    queue_id = %queue_id,
                    message_id = %message_id,
                    "Discarded undecodable message during claim"
                );
                continue;
            }
            match StoredMessage::from_json(data) {
                Ok(message) => claimed.push(ClaimedMessage {
                    message,
                    deadline_ms,
                }),
                Err(e) => {
                    warn!(
                        consumer_id = %consumer_id,
                        queue_id = %queue_id,
                        message_id = %message_id,
                        error = %e,
                        "Discarding corrupted message during claim"
                    );
                    // The rest of the batch is already in flight; a failed
                    // purge leaves this entry to the reclaim sweep.
                    if let Err(e) = self.complete(message_id, queue_id).await {
                        error!(
                            queue_id = %queue_id,
                            message_id = %message_id,
                            error = %e,
                            "Failed to purge corrupted message"
                        );
                    }
                }
            }
        }

        debug!(
            consumer_id = %consumer_id,
            queue_id = %queue_id,
            claimed = claimed.len(),
            "Claimed messages"
        );

        Ok(claimed)
    }

    /// Extends the claim of an in-flight message to `now + extend_by_ms`.
    ///
    /// Returns false when the message is not in flight (never claimed,
    /// completed or already reclaimed). Safe to call repeatedly.
    pub async fn heartbeat(
        &self,
        message_id: &str,
        queue_id: &str,
        extend_by_ms: u64,
    ) -> Result<bool, QueueError> {
        let shard = self.shard_of(queue_id);
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .heartbeat_script
            .key(self.keys.inflight_key(shard))
            .arg(inflight_member(message_id, queue_id))
            .arg(now_ms() + extend_by_ms as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    /// Removes a processed message. Completing twice is not an error.
    ///
    /// Returns whether the message was still in flight.
    pub async fn complete(&self, message_id: &str, queue_id: &str) -> Result<bool, QueueError> {
        let shard = self.shard_of(queue_id);
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .complete_script
            .key(self.keys.inflight_key(shard))
            .key(self.keys.inflight_data_key(shard))
            .key(self.keys.queue_items_key(queue_id))
            .arg(inflight_member(message_id, queue_id))
            .arg(message_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    /// Returns one in-flight message to its queue at its original timestamp.
    pub async fn release(
        &self,
        message: &StoredMessage,
        queue_id: &str,
    ) -> Result<bool, QueueError> {
        let released = self
            .release_batch(queue_id, &[ReleaseRequest::original(message)])
            .await?;
        Ok(released == 1)
    }

    /// Returns in-flight messages of one queue in a single script.
    ///
    /// Messages no longer in flight are skipped. Returns how many were
    /// actually released.
    pub async fn release_batch(
        &self,
        queue_id: &str,
        requests: &[ReleaseRequest],
    ) -> Result<usize, QueueError> {
        if requests.is_empty() {
            return Ok(0);
        }

        let shard = self.shard_of(queue_id);
        let queue_keys = self.queue_keys(queue_id);
        let mut invocation = self.release_script.prepare_invoke();
        invocation
            .key(self.keys.inflight_key(shard))
            .key(self.keys.inflight_data_key(shard))
            .key(&queue_keys.queue_key)
            .key(&queue_keys.items_key)
            .key(&queue_keys.master_key)
            .arg(queue_id);
        for request in requests {
            let body = match &request.updated {
                Some(message) => message.to_json()?,
                None => String::new(),
            };
            invocation
                .arg(&request.message_id)
                .arg(request.score)
                .arg(body);
        }

        let mut conn = self.redis.clone();
        let released: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(released.max(0) as usize)
    }

    /// Returns every timed-out claim of a shard to its queue.
    ///
    /// `resolve` maps a queue id to its keys. When a claimed body is
    /// corrupted the tenant is derived from the queue id and the message goes
    /// back at the current time.
    pub async fn reclaim_timed_out<F>(
        &self,
        shard: u32,
        resolve: F,
    ) -> Result<Vec<ReclaimedMessageInfo>, QueueError>
    where
        F: Fn(&str) -> QueueKeys,
    {
        let now = now_ms();
        let mut conn = self.redis.clone();
        let raw: Vec<String> = self
            .scan_expired_script
            .key(self.keys.inflight_key(shard))
            .key(self.keys.inflight_data_key(shard))
            .arg(now)
            .arg(self.reclaim_batch_size)
            .invoke_async(&mut conn)
            .await?;

        let mut reclaimed = Vec::new();
        for pair in raw.chunks_exact(2) {
            let (member, data) = (&pair[0], &pair[1]);
            let Some((message_id, queue_id)) = parse_inflight_member(member) else {
                warn!(shard, member = %member, "Dropping malformed in-flight member");
                let _: i64 = conn.zrem(self.keys.inflight_key(shard), member).await?;
                continue;
            };

            let (score, tenant_id, metadata) = match StoredMessage::from_json(data) {
                Ok(message) => (message.timestamp, message.tenant_id, message.metadata),
                Err(e) => {
                    warn!(
                        shard,
                        message_id = %message_id,
                        queue_id = %queue_id,
                        error = %e,
                        "Corrupted in-flight record, deriving tenant from queue id"
                    );
                    let tenant_id = self
                        .keys
                        .tenant_id_from_queue(queue_id)
                        .unwrap_or_default();
                    (now, tenant_id, MessageMetadata::new())
                }
            };

            let queue_keys = resolve(queue_id);
            let released: i64 = self
                .release_script
                .key(self.keys.inflight_key(shard))
                .key(self.keys.inflight_data_key(shard))
                .key(&queue_keys.queue_key)
                .key(&queue_keys.items_key)
                .key(&queue_keys.master_key)
                .arg(queue_id)
                .arg(message_id)
                .arg(score)
                .arg("")
                .invoke_async(&mut conn)
                .await?;

            if released == 1 {
                reclaimed.push(ReclaimedMessageInfo {
                    message_id: message_id.to_string(),
                    queue_id: queue_id.to_string(),
                    tenant_id,
                    metadata,
                });
            }
        }

        if !reclaimed.is_empty() {
            debug!(shard, reclaimed = reclaimed.len(), "Reclaimed timed-out messages");
        }

        Ok(reclaimed)
    }

    /// Moves an in-flight message to its tenant's dead-letter queue.
    ///
    /// Returns false when the message was no longer in flight.
    pub async fn move_to_dead_letter(
        &self,
        message: &StoredMessage,
        last_error: &str,
    ) -> Result<bool, QueueError> {
        let shard = self.shard_of(&message.queue_id);
        let now = now_ms();
        let dead = DeadLetterMessage::new(message.clone(), last_error, now);

        let mut conn = self.redis.clone();
        let moved: i64 = self
            .dead_letter_script
            .key(self.keys.inflight_key(shard))
            .key(self.keys.inflight_data_key(shard))
            .key(self.keys.queue_items_key(&message.queue_id))
            .key(self.keys.dead_letter_key(&message.tenant_id))
            .key(self.keys.dead_letter_data_key(&message.tenant_id))
            .arg(inflight_member(&message.id, &message.queue_id))
            .arg(&message.id)
            .arg(now)
            .arg(serde_json::to_string(&dead)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    /// Number of claimed messages across every shard.
    pub async fn total_inflight_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let mut total = 0u64;
        for shard in 0..self.shard_count {
            let count: u64 = conn.zcard(self.keys.inflight_key(shard)).await?;
            total += count;
        }
        Ok(total)
    }

    /// Number of dead-lettered messages for a tenant.
    pub async fn dead_letter_queue_length(&self, tenant_id: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.zcard(self.keys.dead_letter_key(tenant_id)).await?;
        Ok(len)
    }

    /// Oldest-first page of a tenant's dead letters. Corrupted entries are skipped.
    pub async fn dead_letter_messages(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.keys.dead_letter_key(tenant_id), 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let data: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.dead_letter_data_key(tenant_id))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());
        for (id, entry) in ids.iter().zip(data) {
            let Some(entry) = entry else {
                continue;
            };
            match serde_json::from_str::<DeadLetterMessage>(&entry) {
                Ok(dead) => messages.push(dead),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, message_id = %id, error = %e, "Skipping corrupted dead letter");
                }
            }
        }
        Ok(messages)
    }

    /// Moves a dead letter back into its live queue, ready immediately.
    ///
    /// Returns false when no such dead letter exists.
    pub async fn redrive_message(
        &self,
        tenant_id: &str,
        message_id: &str,
        policy: RedriveAttemptPolicy,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let entry: Option<String> = conn
            .hget(self.keys.dead_letter_data_key(tenant_id), message_id)
            .await?;
        let Some(entry) = entry else {
            return Ok(false);
        };

        let dead: DeadLetterMessage = serde_json::from_str(&entry)?;
        let mut message = dead.message;
        message.timestamp = now_ms();
        if policy == RedriveAttemptPolicy::Reset {
            message.attempt = 1;
        }

        let queue_keys = self.queue_keys(&message.queue_id);
        let redriven: i64 = self
            .redrive_script
            .key(self.keys.dead_letter_key(tenant_id))
            .key(self.keys.dead_letter_data_key(tenant_id))
            .key(&queue_keys.queue_key)
            .key(&queue_keys.items_key)
            .key(&queue_keys.master_key)
            .arg(message_id)
            .arg(&message.queue_id)
            .arg(message.timestamp)
            .arg(message.to_json()?)
            .invoke_async(&mut conn)
            .await?;
        Ok(redriven == 1)
    }

    /// Number of messages (ready or delayed) waiting in a queue.
    pub async fn queue_length(&self, queue_id: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.zcard(self.keys.queue_key(queue_id)).await?;
        Ok(len)
    }

    /// Number of queues with pending messages across every shard.
    pub async fn total_queue_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let mut total = 0u64;
        for shard in 0..self.shard_count {
            let count: u64 = conn.zcard(self.keys.master_queue_key(shard)).await?;
            total += count;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DefaultKeyProducer;
    use serde_json::json;

    #[test]
    fn test_queue_keys_resolve() {
        let keys = DefaultKeyProducer::new("t");
        let queue_id = "org:a:env:b:queue:c";
        let resolved = QueueKeys::resolve(&keys, queue_id, 4);

        assert_eq!(resolved.queue_key, "t:org:a:env:b:queue:c");
        assert_eq!(resolved.items_key, "t:org:a:env:b:queue:c:items");
        assert_eq!(
            resolved.master_key,
            format!("t:master:{}", shard_for_queue(queue_id, 4))
        );
    }

    #[test]
    fn test_release_request_restores_original_timestamp() {
        let message = StoredMessage::new("org:a:env:b:queue:c", "a", json!(1), 1_234);
        let request = ReleaseRequest::original(&message);
        assert_eq!(request.score, 1_234);
        assert!(request.updated.is_none());

        let retried = message.next_attempt(9_999);
        let request = ReleaseRequest::rescheduled(retried);
        assert_eq!(request.score, 9_999);
        assert_eq!(request.updated.map(|m| m.attempt), Some(2));
    }
}
