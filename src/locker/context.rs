//! Task-local record of the locks held by the current call chain.
//!
//! The record is scoped over a lock callback, so nested `lock()` calls made
//! by that callback (directly or through any depth of `.await`) see it.
//! Tasks spawned from inside the callback start with an empty record.

use std::future::Future;

use tokio_util::sync::CancellationToken;

tokio::task_local! {
    static LOCK_CONTEXT: LockContext;
}

#[derive(Debug, Clone)]
struct HeldLock {
    identity: String,
    resources: Vec<String>,
    signal: CancellationToken,
}

/// Locks held by the current task, outermost first.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockContext {
    held: Vec<HeldLock>,
}

impl LockContext {
    /// Snapshot of the current task's record (empty outside any lock).
    pub(crate) fn current() -> Self {
        LOCK_CONTEXT.try_with(Clone::clone).unwrap_or_default()
    }

    /// Signal of a held lock with exactly this identity.
    pub(crate) fn find(&self, identity: &str) -> Option<CancellationToken> {
        self.held
            .iter()
            .find(|held| held.identity == identity)
            .map(|held| held.signal.clone())
    }

    /// A copy of this record with one more held lock.
    pub(crate) fn with_lock(
        &self,
        identity: String,
        resources: Vec<String>,
        signal: CancellationToken,
    ) -> Self {
        let mut held = self.held.clone();
        held.push(HeldLock {
            identity,
            resources,
            signal,
        });
        Self { held }
    }

    /// Runs `fut` with this record installed.
    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        LOCK_CONTEXT.scope(self, fut).await
    }

    fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self
            .held
            .iter()
            .flat_map(|held| held.resources.iter().cloned())
            .collect();
        resources.sort();
        resources.dedup();
        resources
    }
}

/// Sorted, de-duplicated resources; order of the input does not matter.
pub fn normalize_resources<I, S>(resources: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut normalized: Vec<String> = resources.into_iter().map(Into::into).collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Identity of a lock: its name plus the joined resource list.
pub fn lock_identity(name: &str, resources: &[String]) -> String {
    format!("{}:{}", name, resources.join(","))
}

/// Whether the current task is running inside a held lock.
pub fn is_inside_lock() -> bool {
    LOCK_CONTEXT
        .try_with(|ctx| !ctx.held.is_empty())
        .unwrap_or(false)
}

/// Every resource held by the current task, sorted.
pub fn current_resources() -> Vec<String> {
    LOCK_CONTEXT
        .try_with(LockContext::resources)
        .unwrap_or_default()
}
