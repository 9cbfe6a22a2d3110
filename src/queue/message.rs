//! Message definitions for the fair queue.
//!
//! - `StoredMessage`: the record kept in a queue's items hash
//! - `EnqueueOptions` / `BatchEnqueueOptions`: producer-side requests
//! - `QueueDescriptor`: the queue a message belongs to, as seen by handlers
//! - `DeadLetterMessage`: terminal record for messages that exhausted retries

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::parse_queue_id;

/// Arbitrary string metadata attached to a message at enqueue time.
pub type MessageMetadata = HashMap<String, String>;

/// A message as persisted in Redis.
///
/// `timestamp` is the message's ready-at time in milliseconds. It doubles as
/// its score in the queue's sorted set and is what release and reclaim
/// restore, so a message keeps its place in age ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    /// Unique identifier for this message.
    pub id: String,
    /// Queue the message belongs to.
    pub queue_id: String,
    /// Tenant that owns the message.
    pub tenant_id: String,
    /// Opaque payload supplied by the producer.
    pub payload: serde_json::Value,
    /// Ready-at time in milliseconds since the epoch.
    pub timestamp: i64,
    /// 1-based delivery attempt number.
    pub attempt: u32,
    /// Producer-supplied metadata.
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl StoredMessage {
    /// Creates a first-attempt message.
    pub fn new(
        queue_id: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
        timestamp: i64,
    ) -> Self {
        Self {
            id: new_message_id(),
            queue_id: queue_id.into(),
            tenant_id: tenant_id.into(),
            payload,
            timestamp,
            attempt: 1,
            metadata: MessageMetadata::new(),
        }
    }

    /// Sets the metadata.
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the message rescheduled for its next attempt at `ready_at`.
    pub fn next_attempt(&self, ready_at: i64) -> Self {
        Self {
            timestamp: ready_at,
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Ready-at time as a `DateTime`.
    pub fn ready_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Generates a message id. Ids never contain `:`.
pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A single enqueue request.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue_id: String,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    /// Delay delivery until this time. Defaults to now.
    pub available_at: Option<DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

impl EnqueueOptions {
    pub fn new(
        queue_id: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            tenant_id: tenant_id.into(),
            payload,
            available_at: None,
            metadata: MessageMetadata::new(),
        }
    }

    pub fn with_available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One message inside a batch enqueue.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub payload: serde_json::Value,
    pub available_at: Option<DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

impl BatchMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            available_at: None,
            metadata: MessageMetadata::new(),
        }
    }

    pub fn with_available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// A batch enqueue request; all messages share a queue and tenant.
#[derive(Debug, Clone)]
pub struct BatchEnqueueOptions {
    pub queue_id: String,
    pub tenant_id: String,
    pub messages: Vec<BatchMessage>,
}

/// The queue a delivered message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub queue_id: String,
    pub tenant_id: String,
    pub org_id: Option<String>,
    pub env_id: Option<String>,
}

impl QueueDescriptor {
    /// Describes a queue owned by `tenant_id`; org and env come from the queue id.
    pub fn new(queue_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let queue_id = queue_id.into();
        let parts = parse_queue_id(&queue_id);
        let org_id = parts.map(|p| p.org_id.to_string());
        let env_id = parts.map(|p| p.env_id.to_string());
        Self {
            queue_id,
            tenant_id: tenant_id.into(),
            org_id,
            env_id,
        }
    }

    /// Describes the queue of a stored message.
    pub fn for_message(message: &StoredMessage) -> Self {
        Self::new(message.queue_id.clone(), message.tenant_id.clone())
    }
}

/// A message moved to the dead-letter queue after exhausting its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterMessage {
    pub message: StoredMessage,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error reported by the final failed attempt.
    pub last_error: String,
    /// When the message was dead-lettered, in milliseconds.
    pub dead_lettered_at: i64,
}

impl DeadLetterMessage {
    pub fn new(message: StoredMessage, last_error: impl Into<String>, now_ms: i64) -> Self {
        Self {
            attempts: message.attempt,
            message,
            last_error: last_error.into(),
            dead_lettered_at: now_ms,
        }
    }
}

/// What a redrive does with the attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RedriveAttemptPolicy {
    /// Start over at attempt 1.
    #[default]
    Reset,
    /// Keep the attempt count the message died with.
    Preserve,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_defaults() {
        let message = StoredMessage::new("org:a:env:b:queue:c", "a", json!({"n": 1}), 1_000);

        assert!(!message.id.is_empty());
        assert!(!message.id.contains(':'));
        assert_eq!(message.attempt, 1);
        assert_eq!(message.timestamp, 1_000);
        assert!(message.metadata.is_empty());
    }

    #[test]
    fn test_next_attempt_keeps_identity() {
        let message = StoredMessage::new("org:a:env:b:queue:c", "a", json!(null), 1_000);
        let retried = message.next_attempt(5_000);

        assert_eq!(retried.id, message.id);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.timestamp, 5_000);
        assert_eq!(retried.payload, message.payload);
    }

    #[test]
    fn test_stored_message_json_tolerates_missing_metadata() {
        let data = r#"{"id":"m1","queue_id":"org:a:env:b:queue:c","tenant_id":"a","payload":{"x":1},"timestamp":10,"attempt":2}"#;
        let message = StoredMessage::from_json(data).expect("should parse");
        assert_eq!(message.attempt, 2);
        assert!(message.metadata.is_empty());

        assert!(StoredMessage::from_json("{not json").is_err());
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Email {
            to: String,
        }
        let message =
            StoredMessage::new("org:a:env:b:queue:c", "a", json!({"to": "x@y.z"}), 0);
        let email: Email = message.payload_as().expect("payload should decode");
        assert_eq!(email.to, "x@y.z");
    }

    #[test]
    fn test_queue_descriptor_for_message() {
        let message = StoredMessage::new("org:acme:env:prod:queue:jobs", "acme", json!(1), 0);
        let descriptor = QueueDescriptor::for_message(&message);

        assert_eq!(descriptor.org_id.as_deref(), Some("acme"));
        assert_eq!(descriptor.env_id.as_deref(), Some("prod"));
        assert_eq!(descriptor.tenant_id, "acme");

        let odd = StoredMessage::new("custom-queue", "t", json!(1), 0);
        let descriptor = QueueDescriptor::for_message(&odd);
        assert!(descriptor.org_id.is_none());
        assert!(descriptor.env_id.is_none());
    }

    #[test]
    fn test_dead_letter_records_attempts() {
        let message = StoredMessage::new("org:a:env:b:queue:c", "a", json!(1), 0).next_attempt(10);
        let dead = DeadLetterMessage::new(message, "boom", 99);

        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error, "boom");
        assert_eq!(dead.dead_lettered_at, 99);
    }

    #[test]
    fn test_enqueue_options_builder() {
        let at = Utc::now();
        let options = EnqueueOptions::new("org:a:env:b:queue:c", "a", json!({}))
            .with_available_at(at)
            .with_metadata("source", "api");

        assert_eq!(options.available_at, Some(at));
        assert_eq!(options.metadata.get("source").map(String::as_str), Some("api"));
    }
}
