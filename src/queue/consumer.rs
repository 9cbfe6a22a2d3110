//! Consumer loops and the reclaim sweep.
//!
//! A consumer pass walks every shard: ask the scheduler for an ordered list
//! of queues, then for each queue
//!
//! 1. skip it while it is cooling off,
//! 2. claim at most as many messages as every concurrency group has room for,
//! 3. reserve each claimed message in its groups ([`ClaimedBatch::admit`]),
//! 4. hand admitted messages to the handler on the task tracker.
//!
//! A claimed message always ends up dispatched or released back to its
//! queue. The batch guard releases whatever is still pending when it is
//! dropped, so an error or cancellation between claim and dispatch cannot
//! strand messages in flight.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::cooloff::CooloffTracker;
use super::handler::{MessageContext, MessageHandler};
use super::QueueCore;
use crate::concurrency::Reservation;
use crate::error::QueueError;
use crate::queue::message::QueueDescriptor;
use crate::visibility::{ClaimedMessage, ReleaseRequest};

/// Messages claimed from one queue that have not been dispatched yet.
pub(crate) struct ClaimedBatch {
    core: Arc<QueueCore>,
    queue_id: String,
    pending: Vec<ClaimedMessage>,
}

/// Outcome of admitting a claimed batch.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    /// Messages holding reservations in every group, ready to dispatch.
    pub admitted: Vec<ClaimedMessage>,
    /// Messages released back to the queue.
    pub released: usize,
    /// Group that was full, if any.
    pub rejected_by: Option<String>,
}

impl ClaimedBatch {
    pub(crate) fn new(core: Arc<QueueCore>, queue_id: &str, claimed: Vec<ClaimedMessage>) -> Self {
        Self {
            core,
            queue_id: queue_id.to_string(),
            pending: claimed,
        }
    }

    /// Reserves concurrency for messages in claim order. At the first
    /// rejection the remaining messages are released back to the queue.
    pub(crate) async fn admit(mut self) -> Result<Admission, QueueError> {
        let mut admission = Admission::default();

        while !self.pending.is_empty() {
            let queue = QueueDescriptor::for_message(&self.pending[0].message);
            let message_id = self.pending[0].message.id.clone();
            match self.core.concurrency.reserve(&queue, &message_id).await {
                Ok(Reservation::Reserved) => {
                    admission.admitted.push(self.pending.remove(0));
                }
                Ok(Reservation::Rejected { group }) => {
                    admission.rejected_by = Some(group);
                    break;
                }
                Err(e) => {
                    self.unreserve(std::mem::take(&mut admission.admitted)).await;
                    return Err(e);
                }
            }
        }

        if !self.pending.is_empty() {
            let requests: Vec<ReleaseRequest> = self
                .pending
                .iter()
                .map(|c| ReleaseRequest::original(&c.message))
                .collect();
            admission.released = self
                .core
                .visibility
                .release_batch(&self.queue_id, &requests)
                .await?;
            self.pending.clear();

            if let Some(group) = &admission.rejected_by {
                self.core
                    .metrics
                    .record_admission_rejected(group, admission.released);
                debug!(
                    queue_id = %self.queue_id,
                    group = %group,
                    released = admission.released,
                    "Concurrency group full, released claimed messages"
                );
            }
        }

        Ok(admission)
    }

    /// Drops reservations already taken and puts the messages back in `pending`.
    async fn unreserve(&mut self, admitted: Vec<ClaimedMessage>) {
        for claimed in admitted {
            let queue = QueueDescriptor::for_message(&claimed.message);
            if let Err(e) = self
                .core
                .concurrency
                .release(&queue, &claimed.message.id)
                .await
            {
                warn!(
                    message_id = %claimed.message.id,
                    error = %e,
                    "Failed to drop reservation of undispatched message"
                );
            }
            self.pending.push(claimed);
        }
    }
}

impl Drop for ClaimedBatch {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let requests: Vec<ReleaseRequest> = self
            .pending
            .drain(..)
            .map(|c| ReleaseRequest::original(&c.message))
            .collect();
        let core = Arc::clone(&self.core);
        let queue_id = std::mem::take(&mut self.queue_id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                queue_id = %queue_id,
                count = requests.len(),
                "No runtime to release undispatched messages; left for reclaim"
            );
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = core.visibility.release_batch(&queue_id, &requests).await {
                error!(
                    queue_id = %queue_id,
                    error = %e,
                    "Failed to release undispatched messages; left for reclaim"
                );
            }
        });
    }
}

/// A single consumer loop.
pub(crate) struct Consumer {
    id: String,
    index: usize,
    core: Arc<QueueCore>,
    handler: Arc<dyn MessageHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    cooloff: CooloffTracker,
    cooloff_size: Arc<AtomicUsize>,
}

impl Consumer {
    pub(crate) fn new(
        index: usize,
        core: Arc<QueueCore>,
        handler: Arc<dyn MessageHandler>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
        cooloff_size: Arc<AtomicUsize>,
    ) -> Self {
        let cooloff = CooloffTracker::new(core.config.cooloff.clone());
        Self {
            id: format!("consumer-{}", index),
            index,
            core,
            handler,
            tracker,
            shutdown,
            cooloff,
            cooloff_size,
        }
    }

    /// Polls until shutdown. Store errors are logged and the loop backs off
    /// one interval.
    pub(crate) async fn run(mut self) {
        info!(consumer_id = %self.id, "Consumer started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let dispatched = match self.poll_once().await {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    error!(consumer_id = %self.id, error = %e, "Consumer pass failed");
                    0
                }
            };
            self.cooloff_size.store(self.cooloff.len(), Ordering::Relaxed);

            if dispatched == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.core.config.consumer_interval) => {}
                }
            }
        }

        info!(consumer_id = %self.id, "Consumer stopped");
    }

    /// One pass over every shard. Returns how many messages were dispatched.
    async fn poll_once(&mut self) -> Result<usize, QueueError> {
        let shard_count = self.core.visibility.shard_count();
        let mut dispatched = 0;

        for offset in 0..shard_count {
            let shard = (self.index as u32 + offset) % shard_count;
            let parent_key = self.core.keys.master_queue_key(shard);
            let queues = self
                .core
                .scheduler
                .select_queues(&parent_key, &self.id, &self.core.scheduler_ctx)
                .await?;

            for queue_id in queues {
                if self.shutdown.is_cancelled() {
                    return Ok(dispatched);
                }
                dispatched += self.service_queue(&queue_id).await?;
            }
        }

        if dispatched == 0 {
            debug!(consumer_id = %self.id, "No messages available");
        }
        Ok(dispatched)
    }

    async fn service_queue(&mut self, queue_id: &str) -> Result<usize, QueueError> {
        let now = Instant::now();
        if self.cooloff.is_cooling_off(queue_id, now) {
            return Ok(0);
        }

        // Tenant limits are checked per message in `admit`.
        let mut max = self.core.config.claim_mode.max_per_claim();
        if let Some(available) = self.core.concurrency.queue_capacity(queue_id).await? {
            max = max.min(available as usize);
        }
        if max == 0 {
            return Ok(0);
        }

        let claimed = self
            .core
            .visibility
            .claim_batch(
                queue_id,
                &self.id,
                self.core.config.visibility_timeout.as_millis() as u64,
                max,
            )
            .await?;

        if claimed.is_empty() {
            if self.cooloff.record_empty(queue_id, now) {
                debug!(consumer_id = %self.id, queue_id = %queue_id, "Queue entered cooloff");
            }
            return Ok(0);
        }
        self.cooloff.record_success(queue_id);

        let admission = ClaimedBatch::new(Arc::clone(&self.core), queue_id, claimed)
            .admit()
            .await?;

        let count = admission.admitted.len();
        for claimed in admission.admitted {
            let core = Arc::clone(&self.core);
            let handler = Arc::clone(&self.handler);
            self.tracker.spawn(dispatch(core, handler, claimed));
        }
        Ok(count)
    }
}

/// Runs the handler for one admitted message and settles it if the handler
/// did not.
pub(crate) async fn dispatch(
    core: Arc<QueueCore>,
    handler: Arc<dyn MessageHandler>,
    claimed: ClaimedMessage,
) {
    let message = claimed.message;
    let queue = QueueDescriptor::for_message(&message);
    let settled = Arc::new(AtomicBool::new(false));
    let started = Instant::now();
    let ctx = MessageContext::new(
        message.clone(),
        queue.clone(),
        Arc::clone(&core),
        Arc::clone(&settled),
        started,
    );

    core.metrics.inc_active_handlers();
    let result = AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await;
    core.metrics.dec_active_handlers();

    if settled.swap(true, Ordering::SeqCst) {
        return;
    }

    let settle = match result {
        Ok(Ok(())) => core.complete_message(&message, &queue, started.elapsed()).await,
        Ok(Err(e)) => core
            .fail_message(&message, &queue, &e.to_string(), started.elapsed())
            .await
            .map(|_| ()),
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            warn!(message_id = %message.id, queue_id = %message.queue_id, reason = %reason, "Handler panicked");
            core.fail_message(&message, &queue, &reason, started.elapsed())
                .await
                .map(|_| ())
        }
    };

    if let Err(e) = settle {
        error!(
            message_id = %message.id,
            queue_id = %message.queue_id,
            error = %e,
            "Failed to settle message; it will be reclaimed"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Returns timed-out claims to their queues and drops their reservations.
pub(crate) async fn run_reclaim_sweep(core: Arc<QueueCore>, shutdown: CancellationToken) {
    info!(interval_ms = core.config.reclaim_interval.as_millis() as u64, "Reclaim sweep started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(core.config.reclaim_interval) => {}
        }

        for shard in 0..core.visibility.shard_count() {
            if let Err(e) = reclaim_shard(&core, shard).await {
                error!(shard, error = %e, "Reclaim pass failed");
            }
        }
    }

    info!("Reclaim sweep stopped");
}

/// One reclaim pass over one shard. Returns how many messages came back.
pub(crate) async fn reclaim_shard(core: &QueueCore, shard: u32) -> Result<usize, QueueError> {
    let reclaimed = core
        .visibility
        .reclaim_timed_out(shard, |queue_id| core.visibility.queue_keys(queue_id))
        .await?;

    for info in &reclaimed {
        let queue = QueueDescriptor::new(info.queue_id.clone(), info.tenant_id.clone());
        if let Err(e) = core.concurrency.release(&queue, &info.message_id).await {
            warn!(
                message_id = %info.message_id,
                queue_id = %info.queue_id,
                error = %e,
                "Failed to drop reservation of reclaimed message"
            );
        }
    }

    if !reclaimed.is_empty() {
        info!(shard, count = reclaimed.len(), "Reclaimed timed-out messages");
    }
    core.metrics.record_reclaimed(shard, reclaimed.len());
    Ok(reclaimed.len())
}
