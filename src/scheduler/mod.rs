//! Fair selection of queues to service next.
//!
//! Given a shard's master index (queues with pending work, scored by their
//! oldest ready message), a scheduler returns a bounded, ordered list of
//! queue ids. Consumers walk that list and claim from each queue in turn.
//!
//! - **FairDequeuingStrategy**: seeded, weighted shuffle of orgs and envs
//!   biased by concurrency limit and headroom, age-ordered queues within an env
//! - **DrrScheduler**: deficit round robin over orgs
//!
//! Both exclude orgs and envs that are at their concurrency limit. The data
//! they need comes through [`SchedulerContext`] so the algorithms can be
//! exercised without a store.
//!
//! # Architecture
//!
//! ```text
//!   master index ──▶ SchedulerContext ──▶ QueueScheduler ──▶ [queue ids]
//!                          ▲
//!   concurrency sets ──────┘
//! ```

pub mod drr;
pub mod fair_dequeuing;
pub mod redis_context;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use crate::concurrency::ConcurrencySnapshot;
use crate::error::QueueError;
use crate::keys::parse_queue_id;

pub use drr::{DrrConfig, DrrScheduler};
pub use fair_dequeuing::{FairDequeuingConfig, FairDequeuingStrategy, SchedulerBiases};
pub use redis_context::RedisSchedulerContext;

/// A queue with ready work and the ready-at time of its oldest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCandidate {
    pub queue_id: String,
    pub oldest_ready_ms: i64,
}

impl QueueCandidate {
    pub fn new(queue_id: impl Into<String>, oldest_ready_ms: i64) -> Self {
        Self {
            queue_id: queue_id.into(),
            oldest_ready_ms,
        }
    }

    /// How long the oldest message has been waiting.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.oldest_ready_ms).max(0)
    }
}

/// Read access to the data a scheduler needs.
#[async_trait]
pub trait SchedulerContext: Send + Sync {
    /// Up to `limit` queues whose oldest message is ready at `now_ms`,
    /// oldest first, ties by queue id.
    async fn ready_queues(
        &self,
        parent_queue_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueCandidate>, QueueError>;

    /// Org usage and limit, or `None` if orgs are not concurrency-limited.
    async fn org_concurrency(
        &self,
        org_id: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError>;

    /// Env usage and limit, or `None` if envs are not concurrency-limited.
    async fn env_concurrency(
        &self,
        org_id: &str,
        env_id: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError>;
}

/// Orders queues of a master index for one consumer.
#[async_trait]
pub trait QueueScheduler: Send + Sync {
    async fn select_queues(
        &self,
        parent_queue_key: &str,
        consumer_id: &str,
        ctx: &dyn SchedulerContext,
    ) -> Result<Vec<String>, QueueError>;

    /// Entries held in any internal cache.
    fn cache_size(&self) -> usize {
        0
    }
}

/// Queues of one environment, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSnapshot {
    pub env_id: String,
    pub concurrency: Option<ConcurrencySnapshot>,
    pub queues: Vec<QueueCandidate>,
}

/// Environments of one org that passed admission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrgSnapshot {
    pub org_id: String,
    pub concurrency: Option<ConcurrencySnapshot>,
    pub envs: Vec<EnvSnapshot>,
}

impl OrgSnapshot {
    /// Mean age of the org's candidate queues.
    pub fn average_age_ms(&self, now_ms: i64) -> f64 {
        let (total, count) = self
            .envs
            .iter()
            .flat_map(|env| env.queues.iter())
            .fold((0i64, 0usize), |(total, count), q| {
                (total + q.age_ms(now_ms), count + 1)
            });
        if count == 0 {
            return 0.0;
        }
        total as f64 / count as f64
    }

    pub fn queue_count(&self) -> usize {
        self.envs.iter().map(|env| env.queues.len()).sum()
    }
}

/// Candidates keyed by org id, then env id.
pub type GroupedCandidates = BTreeMap<String, BTreeMap<String, Vec<QueueCandidate>>>;

/// Groups candidates by org then env, in org/env id order, queues oldest
/// first (ties by queue id). Ids that do not parse are dropped.
pub fn group_candidates(candidates: Vec<QueueCandidate>) -> GroupedCandidates {
    let mut grouped = GroupedCandidates::new();
    for candidate in candidates {
        let Some(parts) = parse_queue_id(&candidate.queue_id) else {
            warn!(queue_id = %candidate.queue_id, "Skipping queue with malformed id");
            continue;
        };
        let (org_id, env_id) = (parts.org_id.to_string(), parts.env_id.to_string());
        grouped
            .entry(org_id)
            .or_default()
            .entry(env_id)
            .or_default()
            .push(candidate);
    }

    for envs in grouped.values_mut() {
        for queues in envs.values_mut() {
            queues.sort_by(|a, b| {
                a.oldest_ready_ms
                    .cmp(&b.oldest_ready_ms)
                    .then_with(|| a.queue_id.cmp(&b.queue_id))
            });
        }
    }
    grouped
}

/// Reads the master index and applies the org/env admission filter.
///
/// Orgs at their limit are dropped with all their envs; envs at their limit
/// are dropped individually; orgs left with no envs are dropped.
pub async fn admitted_snapshot(
    ctx: &dyn SchedulerContext,
    parent_queue_key: &str,
    now_ms: i64,
    limit: usize,
) -> Result<Vec<OrgSnapshot>, QueueError> {
    let candidates = ctx.ready_queues(parent_queue_key, now_ms, limit).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut orgs = Vec::new();
    for (org_id, envs) in group_candidates(candidates) {
        let org_concurrency = ctx.org_concurrency(&org_id).await?;
        if org_concurrency.is_some_and(|c| c.is_at_limit()) {
            continue;
        }

        let mut admitted_envs = Vec::new();
        for (env_id, queues) in envs {
            let env_concurrency = ctx.env_concurrency(&org_id, &env_id).await?;
            if env_concurrency.is_some_and(|c| c.is_at_limit()) {
                continue;
            }
            admitted_envs.push(EnvSnapshot {
                env_id,
                concurrency: env_concurrency,
                queues,
            });
        }

        if !admitted_envs.is_empty() {
            orgs.push(OrgSnapshot {
                org_id,
                concurrency: org_concurrency,
                envs: admitted_envs,
            });
        }
    }
    Ok(orgs)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory scheduler context for unit tests.

    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Default, Clone)]
    pub struct StaticContext {
        pub queues: Vec<QueueCandidate>,
        pub orgs: HashMap<String, ConcurrencySnapshot>,
        pub envs: HashMap<(String, String), ConcurrencySnapshot>,
    }

    impl StaticContext {
        pub fn with_queue(mut self, org: &str, env: &str, name: &str, ready_ms: i64) -> Self {
            self.queues.push(QueueCandidate::new(
                format!("org:{org}:env:{env}:queue:{name}"),
                ready_ms,
            ));
            self
        }

        pub fn with_org_limit(mut self, org: &str, current: u64, limit: u64) -> Self {
            self.orgs
                .insert(org.to_string(), ConcurrencySnapshot { current, limit });
            self
        }

        pub fn with_env_limit(mut self, org: &str, env: &str, current: u64, limit: u64) -> Self {
            self.envs.insert(
                (org.to_string(), env.to_string()),
                ConcurrencySnapshot { current, limit },
            );
            self
        }
    }

    #[async_trait]
    impl SchedulerContext for StaticContext {
        async fn ready_queues(
            &self,
            _parent_queue_key: &str,
            now_ms: i64,
            limit: usize,
        ) -> Result<Vec<QueueCandidate>, QueueError> {
            let mut ready: Vec<QueueCandidate> = self
                .queues
                .iter()
                .filter(|q| q.oldest_ready_ms <= now_ms)
                .cloned()
                .collect();
            ready.sort_by(|a, b| {
                a.oldest_ready_ms
                    .cmp(&b.oldest_ready_ms)
                    .then_with(|| a.queue_id.cmp(&b.queue_id))
            });
            ready.truncate(limit);
            Ok(ready)
        }

        async fn org_concurrency(
            &self,
            org_id: &str,
        ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
            Ok(self.orgs.get(org_id).copied())
        }

        async fn env_concurrency(
            &self,
            org_id: &str,
            env_id: &str,
        ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
            Ok(self
                .envs
                .get(&(org_id.to_string(), env_id.to_string()))
                .copied())
        }
    }
}
