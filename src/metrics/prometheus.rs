//! Prometheus metrics registration and export.
//!
//! All metrics live in a single registry behind `OnceLock` statics. Recording
//! before [`init_metrics`] is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fairq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages written by enqueue, labeled by tenant.
pub static MESSAGES_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Messages whose handler completed, labeled by tenant.
pub static MESSAGES_COMPLETED: OnceLock<CounterVec> = OnceLock::new();

/// Handler failures, labeled by tenant and outcome (retried / dead_lettered / dropped).
pub static MESSAGES_FAILED: OnceLock<CounterVec> = OnceLock::new();

/// Timed-out claims returned to their queue, labeled by shard.
pub static MESSAGES_RECLAIMED: OnceLock<CounterVec> = OnceLock::new();

/// Claimed messages sent back because a concurrency group was full, labeled by group.
pub static ADMISSION_REJECTED: OnceLock<CounterVec> = OnceLock::new();

/// Handler invocations currently running.
pub static ACTIVE_HANDLERS: OnceLock<Gauge> = OnceLock::new();

/// Handler run time in seconds, labeled by outcome.
pub static HANDLER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Lock acquisitions, labeled by lock name and result (acquired / reentrant / timeout).
pub static LOCK_ACQUISITIONS: OnceLock<CounterVec> = OnceLock::new();

/// Time spent waiting to acquire a lock, in seconds.
pub static LOCK_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry that is
/// discarded, so the first registration wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Message lifecycle
    let messages_enqueued = CounterVec::new(
        Opts::new("fairq_messages_enqueued_total", "Messages enqueued"),
        &["tenant"],
    )?;

    let messages_completed = CounterVec::new(
        Opts::new("fairq_messages_completed_total", "Messages completed"),
        &["tenant"],
    )?;

    let messages_failed = CounterVec::new(
        Opts::new("fairq_messages_failed_total", "Handler failures by outcome"),
        &["tenant", "outcome"],
    )?;

    let messages_reclaimed = CounterVec::new(
        Opts::new(
            "fairq_messages_reclaimed_total",
            "Timed-out claims returned to their queue",
        ),
        &["shard"],
    )?;

    let admission_rejected = CounterVec::new(
        Opts::new(
            "fairq_admission_rejected_total",
            "Claimed messages released because a concurrency group was full",
        ),
        &["group"],
    )?;

    // Handlers
    let active_handlers = Gauge::new("fairq_active_handlers", "Handler invocations running")?;

    let handler_duration = HistogramVec::new(
        HistogramOpts::new("fairq_handler_duration_seconds", "Handler run time in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["outcome"],
    )?;

    // Locks
    let lock_acquisitions = CounterVec::new(
        Opts::new("fairq_lock_acquisitions_total", "Lock acquisition attempts"),
        &["lock", "result"],
    )?;

    let lock_wait = Histogram::with_opts(
        HistogramOpts::new("fairq_lock_wait_seconds", "Time spent acquiring locks")
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    registry.register(Box::new(messages_enqueued.clone()))?;
    registry.register(Box::new(messages_completed.clone()))?;
    registry.register(Box::new(messages_failed.clone()))?;
    registry.register(Box::new(messages_reclaimed.clone()))?;
    registry.register(Box::new(admission_rejected.clone()))?;
    registry.register(Box::new(active_handlers.clone()))?;
    registry.register(Box::new(handler_duration.clone()))?;
    registry.register(Box::new(lock_acquisitions.clone()))?;
    registry.register(Box::new(lock_wait.clone()))?;

    // Already-set statics mean an earlier call won
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_ENQUEUED.set(messages_enqueued);
    let _ = MESSAGES_COMPLETED.set(messages_completed);
    let _ = MESSAGES_FAILED.set(messages_failed);
    let _ = MESSAGES_RECLAIMED.set(messages_reclaimed);
    let _ = ADMISSION_REJECTED.set(admission_rejected);
    let _ = ACTIVE_HANDLERS.set(active_handlers);
    let _ = HANDLER_DURATION.set(handler_duration);
    let _ = LOCK_ACQUISITIONS.set(lock_acquisitions);
    let _ = LOCK_WAIT.set(lock_wait);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
