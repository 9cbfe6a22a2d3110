//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`crate::metrics::init_metrics`] has run, so
//! library code records unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_HANDLERS, ADMISSION_REJECTED, HANDLER_DURATION, LOCK_ACQUISITIONS, LOCK_WAIT,
    MESSAGES_COMPLETED, MESSAGES_ENQUEUED, MESSAGES_FAILED, MESSAGES_RECLAIMED,
};

/// What happened to a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retried,
    DeadLettered,
    Dropped,
}

impl FailureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOutcome::Retried => "retried",
            FailureOutcome::DeadLettered => "dead_lettered",
            FailureOutcome::Dropped => "dropped",
        }
    }
}

/// Result of a lock call, for labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Reentrant,
    Timeout,
}

impl LockOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Acquired => "acquired",
            LockOutcome::Reentrant => "reentrant",
            LockOutcome::Timeout => "timeout",
        }
    }
}

/// Metrics collector for queue and lock operations.
///
/// # Example
///
/// ```ignore
/// use fairq::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_enqueued("tenant-1", 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record messages written to a queue.
    pub fn record_enqueued(&self, tenant_id: &str, count: usize) {
        if let Some(enqueued) = MESSAGES_ENQUEUED.get() {
            enqueued
                .with_label_values(&[tenant_id])
                .inc_by(count as f64);
        }

        tracing::trace!(tenant_id = tenant_id, count = count, "Recorded enqueue metric");
    }

    /// Record a handler that completed its message.
    pub fn record_completed(&self, tenant_id: &str, duration: Duration) {
        if let Some(completed) = MESSAGES_COMPLETED.get() {
            completed.with_label_values(&[tenant_id]).inc();
        }

        if let Some(handler_duration) = HANDLER_DURATION.get() {
            handler_duration
                .with_label_values(&["completed"])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a handler failure and what was done with the message.
    pub fn record_failed(&self, tenant_id: &str, outcome: FailureOutcome, duration: Duration) {
        if let Some(failed) = MESSAGES_FAILED.get() {
            failed
                .with_label_values(&[tenant_id, outcome.as_str()])
                .inc();
        }

        if let Some(handler_duration) = HANDLER_DURATION.get() {
            handler_duration
                .with_label_values(&["failed"])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            tenant_id = tenant_id,
            outcome = outcome.as_str(),
            "Recorded failure metric"
        );
    }

    /// Record timed-out claims returned by a reclaim pass.
    pub fn record_reclaimed(&self, shard: u32, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(reclaimed) = MESSAGES_RECLAIMED.get() {
            reclaimed
                .with_label_values(&[&shard.to_string()])
                .inc_by(count as f64);
        }
    }

    /// Record claimed messages sent back because `group` was full.
    pub fn record_admission_rejected(&self, group: &str, count: usize) {
        if let Some(rejected) = ADMISSION_REJECTED.get() {
            rejected.with_label_values(&[group]).inc_by(count as f64);
        }
    }

    pub fn inc_active_handlers(&self) {
        if let Some(active) = ACTIVE_HANDLERS.get() {
            active.inc();
        }
    }

    pub fn dec_active_handlers(&self) {
        if let Some(active) = ACTIVE_HANDLERS.get() {
            active.dec();
        }
    }

    /// Record the result of a lock call and how long acquisition took.
    pub fn record_lock(&self, lock_name: &str, outcome: LockOutcome, waited: Duration) {
        if let Some(acquisitions) = LOCK_ACQUISITIONS.get() {
            acquisitions
                .with_label_values(&[lock_name, outcome.as_str()])
                .inc();
        }

        if outcome != LockOutcome::Reentrant {
            if let Some(wait) = LOCK_WAIT.get() {
                wait.observe(waited.as_secs_f64());
            }
        }

        tracing::trace!(
            lock_name = lock_name,
            outcome = outcome.as_str(),
            waited_ms = waited.as_millis() as u64,
            "Recorded lock metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(FailureOutcome::Retried.as_str(), "retried");
        assert_eq!(FailureOutcome::DeadLettered.as_str(), "dead_lettered");
        assert_eq!(FailureOutcome::Dropped.as_str(), "dropped");
        assert_eq!(LockOutcome::Timeout.as_str(), "timeout");
    }

    #[test]
    fn test_record_message_lifecycle() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_enqueued("collector-test", 2);
        collector.record_completed("collector-test", Duration::from_millis(20));
        collector.record_failed(
            "collector-test",
            FailureOutcome::DeadLettered,
            Duration::from_millis(5),
        );
        collector.record_reclaimed(3, 1);
        collector.record_admission_rejected("tenant", 4);

        let text = export_metrics();
        assert!(text.contains("fairq_messages_failed_total"));
    }

    #[test]
    fn test_active_handler_gauge() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_active_handlers();
        collector.dec_active_handlers();
    }

    #[test]
    fn test_record_lock() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_lock("run", LockOutcome::Acquired, Duration::from_millis(3));
        collector.record_lock("run", LockOutcome::Reentrant, Duration::ZERO);
        collector.record_lock("run", LockOutcome::Timeout, Duration::from_secs(2));
    }
}
