//! Error types for fairq operations.
//!
//! Queue-side failures are collected in [`QueueError`]. The distributed lock
//! has its own [`crate::locker::LockError`] because its callers handle
//! acquisition timeouts separately from store trouble.
//!
//! Empty or ineligible claims are not errors: they surface as empty vectors
//! or `None` from the claim APIs.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during queue, visibility and scheduling operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Payload rejected by the configured validator. Nothing was persisted.
    #[error("Payload validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a stored record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message not found in the structure it was expected in.
    #[error("Message {0} not found")]
    MessageNotFound(String),

    /// Queue id does not follow the `org:{org}:env:{env}:queue:{name}` convention.
    #[error("Invalid queue id '{0}'")]
    InvalidQueueId(String),

    /// Consumers are already running.
    #[error("Queue consumers are already running")]
    AlreadyRunning,

    /// Consumers are not running.
    #[error("Queue consumers are not running")]
    NotRunning,

    /// `start()` was called before a handler was registered.
    #[error("No message handler registered")]
    NoHandler,

    /// Active handlers did not finish within the shutdown timeout.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Invalid configuration supplied at construction.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Builds a validation error from a single message.
    pub fn validation(error: impl Into<String>) -> Self {
        QueueError::Validation {
            errors: vec![error.into()],
        }
    }

    /// Whether the error comes from store trouble and is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Redis(_) | QueueError::ConnectionFailed(_)
        )
    }
}
