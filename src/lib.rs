//! fairq: a Redis-backed multi-tenant fair queue.
//!
//! Messages live in per-queue sorted sets grouped by organization and
//! environment. Consumers pick queues through a pluggable fair scheduler,
//! claim messages under a visibility timeout, and settle them through a
//! retry strategy that ends in a per-tenant dead-letter queue. Concurrency
//! groups cap in-flight work per tenant, org, env or queue.
//!
//! The crate also ships [`locker::RunLocker`], a reentrant distributed lock
//! for serializing multi-step state transitions.

pub mod cli;
pub mod concurrency;
pub mod error;
pub mod keys;
pub mod locker;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod visibility;

pub use concurrency::{ConcurrencyGroupConfig, ConcurrencyManager, ConcurrencyScope};
pub use error::QueueError;
pub use keys::{DefaultKeyProducer, KeyProducer};
pub use locker::{LockError, LockSignal, RunLocker, RunLockerConfig};
pub use queue::{
    EnqueueOptions, FairQueue, FairQueueConfig, MessageContext, MessageHandler, StoredMessage,
};
pub use scheduler::{DrrScheduler, FairDequeuingStrategy, QueueScheduler};
