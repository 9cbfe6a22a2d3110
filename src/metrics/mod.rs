//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the message lifecycle (enqueue, completion, failure outcome,
//! reclaim, admission rejection), running handlers and lock acquisition.
//!
//! # Example
//!
//! ```ignore
//! use fairq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_enqueued("tenant-1", 1);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{FailureOutcome, LockOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_HANDLERS, ADMISSION_REJECTED, HANDLER_DURATION, LOCK_ACQUISITIONS, LOCK_WAIT,
    MESSAGES_COMPLETED, MESSAGES_ENQUEUED, MESSAGES_FAILED, MESSAGES_RECLAIMED, REGISTRY,
};
