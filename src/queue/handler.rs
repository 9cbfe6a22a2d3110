//! The consumer callback and the per-delivery context it receives.
//!
//! A handler settles its delivery by calling [`MessageContext::complete`] or
//! [`MessageContext::fail`]. If it returns without settling, `Ok` completes
//! the message and `Err` fails it with the error's message. A panic is a
//! failure too. Settling twice is a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::QueueCore;
use crate::error::QueueError;
use crate::queue::message::{QueueDescriptor, StoredMessage};

/// Processes delivered messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: MessageContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MessageContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// One delivery of a message to a handler.
pub struct MessageContext {
    message: StoredMessage,
    queue: QueueDescriptor,
    core: Arc<QueueCore>,
    settled: Arc<AtomicBool>,
    started: Instant,
}

impl MessageContext {
    pub(crate) fn new(
        message: StoredMessage,
        queue: QueueDescriptor,
        core: Arc<QueueCore>,
        settled: Arc<AtomicBool>,
        started: Instant,
    ) -> Self {
        Self {
            message,
            queue,
            core,
            settled,
            started,
        }
    }

    pub fn message(&self) -> &StoredMessage {
        &self.message
    }

    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.message.payload_as()
    }

    /// Pushes the claim deadline to `now + extend_by`.
    ///
    /// Returns false if the claim was already lost to the reclaim sweep.
    pub async fn heartbeat(&self, extend_by: Duration) -> Result<bool, QueueError> {
        self.core
            .visibility
            .heartbeat(
                &self.message.id,
                &self.message.queue_id,
                extend_by.as_millis() as u64,
            )
            .await
    }

    /// Marks the message processed.
    pub async fn complete(self) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core
            .complete_message(&self.message, &self.queue, self.started.elapsed())
            .await
    }

    /// Marks the delivery failed; the retry strategy decides what happens next.
    pub async fn fail(self, reason: impl Into<String>) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core
            .fail_message(
                &self.message,
                &self.queue,
                &reason.into(),
                self.started.elapsed(),
            )
            .await
            .map(|_| ())
    }
}
