//! Distributed run lock.
//!
//! [`RunLocker`] serializes critical sections across processes by leasing
//! one Redis key per resource. A lock is granted when a majority of the
//! configured nodes (`n/2 + 1`) accept the whole resource set within the
//! lease's drift-adjusted validity.
//!
//! Locks are reentrant per task: a nested `lock()` with the same name and
//! the same resource set runs its callback directly. While the callback
//! runs the lease is renewed on a ticker; if a renewal fails the
//! [`LockSignal`] handed to the callback is cancelled. The lease is released
//! on every exit path, including a panicking or dropped callback.

pub mod config;
mod context;
mod scripts;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::{LockRetryConfig, LockRetryOverrides, RunLockerConfig};
pub use context::{current_resources, is_inside_lock, lock_identity, normalize_resources};

use crate::keys::{DefaultKeyProducer, KeyProducer};
use crate::metrics::{LockOutcome, MetricsCollector};
use context::LockContext;

/// Cancelled when the lease backing a lock is lost or the locker quits.
pub type LockSignal = CancellationToken;

const MIN_EXTEND_PERIOD: Duration = Duration::from_millis(50);
const DRIFT_CONSTANT: Duration = Duration::from_millis(2);

/// Errors raised by [`RunLocker`].
#[derive(Debug, Error)]
pub enum LockError {
    /// Retries or the wall-clock budget ran out before the lock was granted.
    #[error(
        "Timed out acquiring lock on [{}] after {attempts} attempts ({total_wait_time:?})",
        resources.join(", ")
    )]
    AcquisitionTimeout {
        resources: Vec<String>,
        attempts: u32,
        total_wait_time: Duration,
    },

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// `quit()` was called on this locker.
    #[error("Locker has been closed")]
    Closed,

    #[error("Invalid lock resources: {0}")]
    InvalidResources(String),
}

struct ActiveLease {
    keys: Vec<String>,
    token: String,
    signal: LockSignal,
    stop: CancellationToken,
}

struct LockerInner {
    clients: Vec<ConnectionManager>,
    keys: Arc<dyn KeyProducer>,
    config: RunLockerConfig,
    closed: AtomicBool,
    next_lease_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveLease>>,
    acquire_script: Script,
    extend_script: Script,
    release_script: Script,
    metrics: MetricsCollector,
}

/// Redlock-style lock over one or more Redis nodes.
#[derive(Clone)]
pub struct RunLocker {
    inner: Arc<LockerInner>,
}

impl std::fmt::Debug for RunLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLocker")
            .field("nodes", &self.inner.clients.len())
            .field("config", &self.inner.config)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RunLocker {
    /// Creates a locker over a single Redis node.
    pub fn new(redis: ConnectionManager, config: RunLockerConfig) -> Self {
        Self::build(vec![redis], config)
    }

    /// Creates a locker that needs a majority of `nodes` to grant a lock.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidResources` if `nodes` is empty.
    pub fn with_nodes(
        nodes: Vec<ConnectionManager>,
        config: RunLockerConfig,
    ) -> Result<Self, LockError> {
        if nodes.is_empty() {
            return Err(LockError::InvalidResources(
                "at least one Redis node is required".to_string(),
            ));
        }
        Ok(Self::build(nodes, config))
    }

    fn build(clients: Vec<ConnectionManager>, config: RunLockerConfig) -> Self {
        let keys: Arc<dyn KeyProducer> =
            Arc::new(DefaultKeyProducer::new(config.key_prefix.clone()));
        Self {
            inner: Arc::new(LockerInner {
                clients,
                keys,
                config,
                closed: AtomicBool::new(false),
                next_lease_id: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
                acquire_script: Script::new(scripts::ACQUIRE),
                extend_script: Script::new(scripts::EXTEND),
                release_script: Script::new(scripts::RELEASE),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunLockerConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of leases this locker currently holds.
    pub fn held_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Runs `f` while holding `resources` under `name`.
    ///
    /// Resource order does not matter. A nested call from inside `f` with the
    /// same name and resource set runs immediately without touching Redis; a
    /// different set (even overlapping) is acquired normally. The lease is
    /// released before this returns, whatever `f` returns.
    ///
    /// # Errors
    ///
    /// Returns `LockError::AcquisitionTimeout` once retries or the wall-clock
    /// budget are exhausted, `LockError::Closed` after [`quit`](Self::quit),
    /// and `LockError::InvalidResources` for an empty resource list. Errors
    /// from `f` are passed through unchanged.
    pub async fn lock<T, E, R, S, F, Fut>(
        &self,
        name: &str,
        resources: R,
        duration: Duration,
        f: F,
    ) -> Result<T, E>
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(LockSignal) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        if self.is_closed() {
            return Err(LockError::Closed.into());
        }

        let resources = normalize_resources(resources);
        if resources.is_empty() || resources.iter().any(|r| r.is_empty()) {
            return Err(LockError::InvalidResources(format!(
                "lock '{name}' needs at least one non-empty resource"
            ))
            .into());
        }

        let identity = lock_identity(name, &resources);
        let context = LockContext::current();
        if let Some(signal) = context.find(&identity) {
            debug!(lock = %identity, "Reentrant lock, running inline");
            self.inner
                .metrics
                .record_lock(name, LockOutcome::Reentrant, Duration::ZERO);
            return f(signal).await;
        }

        let lease = self.acquire(name, &resources, duration).await?;
        let signal = lease.signal.clone();
        let scoped = context.with_lock(identity, resources, signal.clone());

        let result = scoped.scope(f(signal)).await;
        lease.release().await;
        result
    }

    /// Like [`lock`](Self::lock), but only locks when `condition` holds.
    ///
    /// When it does not, `f` runs with `None` and nothing is acquired.
    pub async fn lock_if<T, E, R, S, F, Fut>(
        &self,
        condition: bool,
        name: &str,
        resources: R,
        duration: Duration,
        f: F,
    ) -> Result<T, E>
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(Option<LockSignal>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        if !condition {
            return f(None).await;
        }
        self.lock(name, resources, duration, |signal| f(Some(signal)))
            .await
    }

    /// Releases every lease held by this locker and refuses further locks.
    ///
    /// Callbacks still running see their signal cancelled.
    pub async fn quit(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let leases: Vec<ActiveLease> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, lease)| lease)
            .collect();

        let count = leases.len();
        for lease in leases {
            lease.stop.cancel();
            lease.signal.cancel();
            self.inner
                .release_everywhere(&lease.keys, &lease.token)
                .await;
        }

        info!(released = count, "Run locker closed");
    }

    async fn acquire(
        &self,
        name: &str,
        resources: &[String],
        duration: Duration,
    ) -> Result<Lease, LockError> {
        let inner = &self.inner;
        let keys: Vec<String> = resources.iter().map(|r| inner.keys.lock_key(r)).collect();
        let token = Uuid::new_v4().to_string();
        let retry = inner.config.retry;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            if self.is_closed() {
                return Err(LockError::Closed);
            }

            attempts += 1;
            if inner.try_acquire(&keys, &token, duration).await {
                break;
            }

            let retries_used = attempts - 1;
            let delay = retry.delay_for(retries_used, &mut rand::rng());
            if retries_used >= retry.max_retries
                || started.elapsed() + delay > retry.max_total_wait_time
            {
                let total_wait_time = started.elapsed();
                inner
                    .metrics
                    .record_lock(name, LockOutcome::Timeout, total_wait_time);
                warn!(
                    lock = name,
                    resources = ?resources,
                    attempts,
                    waited_ms = total_wait_time.as_millis() as u64,
                    "Lock acquisition timed out"
                );
                return Err(LockError::AcquisitionTimeout {
                    resources: resources.to_vec(),
                    attempts,
                    total_wait_time,
                });
            }

            debug!(lock = name, attempts, delay_ms = delay.as_millis() as u64, "Lock busy, backing off");
            tokio::time::sleep(delay).await;
        }

        inner
            .metrics
            .record_lock(name, LockOutcome::Acquired, started.elapsed());
        debug!(lock = name, resources = ?resources, attempts, "Lock acquired");

        let signal = CancellationToken::new();
        let stop = CancellationToken::new();
        let lease_id = inner.next_lease_id.fetch_add(1, Ordering::SeqCst);
        inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                lease_id,
                ActiveLease {
                    keys: keys.clone(),
                    token: token.clone(),
                    signal: signal.clone(),
                    stop: stop.clone(),
                },
            );

        spawn_lease_watch(
            Arc::clone(inner),
            keys.clone(),
            token.clone(),
            duration,
            signal.clone(),
            stop.clone(),
        );

        Ok(Lease {
            inner: Arc::clone(inner),
            lease_id,
            keys,
            token,
            signal,
            stop,
            released: false,
        })
    }
}

impl LockerInner {
    fn quorum(&self) -> usize {
        self.clients.len() / 2 + 1
    }

    /// One acquisition round across all nodes. Partial grants are undone.
    async fn try_acquire(&self, keys: &[String], token: &str, duration: Duration) -> bool {
        let started = Instant::now();
        let ttl_ms = duration.as_millis().max(1) as u64;
        let mut granted = 0usize;

        for client in &self.clients {
            let mut conn = client.clone();
            let mut invocation = self.acquire_script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            invocation.arg(token).arg(ttl_ms);

            match invocation.invoke_async::<_, i64>(&mut conn).await {
                Ok(1) => granted += 1,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Lock node unavailable during acquire"),
            }
        }

        let drift = duration.mul_f64(self.config.drift_factor.max(0.0)) + DRIFT_CONSTANT;
        let valid = duration
            .checked_sub(started.elapsed() + drift)
            .is_some_and(|validity| !validity.is_zero());

        if granted >= self.quorum() && valid {
            return true;
        }

        if granted > 0 {
            self.release_everywhere(keys, token).await;
        }
        false
    }

    async fn extend_everywhere(&self, keys: &[String], token: &str, duration: Duration) -> bool {
        let ttl_ms = duration.as_millis().max(1) as u64;
        let mut extended = 0usize;

        for client in &self.clients {
            let mut conn = client.clone();
            let mut invocation = self.extend_script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            invocation.arg(token).arg(ttl_ms);

            match invocation.invoke_async::<_, i64>(&mut conn).await {
                Ok(1) => extended += 1,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Lock node unavailable during extend"),
            }
        }

        extended >= self.quorum()
    }

    async fn release_everywhere(&self, keys: &[String], token: &str) {
        for client in &self.clients {
            let mut conn = client.clone();
            let mut invocation = self.release_script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            invocation.arg(token);

            if let Err(e) = invocation.invoke_async::<_, i64>(&mut conn).await {
                warn!(error = %e, "Failed to release lock on node");
            }
        }
    }

    fn forget(&self, lease_id: u64) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&lease_id);
    }
}

/// Keeps a lease alive while its callback runs.
///
/// With auto-extension the lease is renewed every third of its duration;
/// without it the signal fires once the lease would have expired.
fn spawn_lease_watch(
    inner: Arc<LockerInner>,
    keys: Vec<String>,
    token: String,
    duration: Duration,
    signal: LockSignal,
    stop: CancellationToken,
) {
    if !inner.config.auto_extend {
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(duration) => signal.cancel(),
            }
        });
        return;
    }

    let period = (duration / 3).max(MIN_EXTEND_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if !inner.extend_everywhere(&keys, &token, duration).await {
                        warn!(keys = ?keys, "Lock lease lost, signalling holder");
                        signal.cancel();
                        break;
                    }
                }
            }
        }
    });
}

/// A granted lease. Dropping it without `release()` releases in the background.
struct Lease {
    inner: Arc<LockerInner>,
    lease_id: u64,
    keys: Vec<String>,
    token: String,
    signal: LockSignal,
    stop: CancellationToken,
    released: bool,
}

impl Lease {
    async fn release(mut self) {
        self.released = true;
        self.stop.cancel();
        self.inner.forget(self.lease_id);
        self.inner
            .release_everywhere(&self.keys, &self.token)
            .await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.stop.cancel();
        self.inner.forget(self.lease_id);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(keys = ?self.keys, "No runtime to release dropped lock; it will expire");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let keys = std::mem::take(&mut self.keys);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            inner.release_everywhere(&keys, &token).await;
        });
    }
}
