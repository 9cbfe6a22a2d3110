//! Deficit round robin over orgs.
//!
//! Every pass credits each org with ready work one quantum (optionally
//! scaled by its concurrency limit). Each queue an org gets into the
//! returned list costs one unit of deficit. Orgs are served highest deficit
//! first; ties rotate between passes so no org is permanently first.
//! An org whose queues were all listed forfeits its leftover deficit, and
//! orgs without ready work are forgotten.
//!
//! State is kept per parent queue (shard), so passes over one shard never
//! disturb the deficits accumulated in another.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use super::{admitted_snapshot, OrgSnapshot, QueueScheduler, SchedulerContext};
use crate::error::QueueError;
use crate::store::now_ms;

/// Cost of listing one queue.
const QUEUE_COST: f64 = 1.0;

/// Configuration for [`DrrScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct DrrConfig {
    /// Deficit credited to each active org per pass.
    pub quantum: f64,
    /// Upper bound on accumulated deficit.
    pub max_deficit: f64,
    /// Scale each org's quantum by its limit relative to the largest limit.
    pub limit_weighted: bool,
    /// Maximum candidate queues read per pass, and maximum returned.
    pub parent_queue_limit: usize,
}

impl Default for DrrConfig {
    fn default() -> Self {
        Self {
            quantum: 1.0,
            max_deficit: 10.0,
            limit_weighted: false,
            parent_queue_limit: 100,
        }
    }
}

impl DrrConfig {
    pub fn with_quantum(mut self, quantum: f64) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn with_max_deficit(mut self, max_deficit: f64) -> Self {
        self.max_deficit = max_deficit;
        self
    }

    pub fn with_limit_weighted(mut self, limit_weighted: bool) -> Self {
        self.limit_weighted = limit_weighted;
        self
    }

    pub fn with_parent_queue_limit(mut self, limit: usize) -> Self {
        self.parent_queue_limit = limit.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct DrrState {
    deficits: HashMap<String, f64>,
    round: usize,
}

pub struct DrrScheduler {
    config: DrrConfig,
    shards: Mutex<HashMap<String, DrrState>>,
}

impl DrrScheduler {
    pub fn new(config: DrrConfig) -> Self {
        Self {
            config,
            shards: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DrrConfig {
        &self.config
    }

    /// Current deficit of an org within one parent queue, if it is tracked.
    pub fn deficit(&self, parent_queue_key: &str, org_id: &str) -> Option<f64> {
        let shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        shards
            .get(parent_queue_key)
            .and_then(|state| state.deficits.get(org_id).copied())
    }

    /// One DRR pass over an admitted snapshot of `parent_queue_key`.
    pub fn schedule(&self, parent_queue_key: &str, orgs: Vec<OrgSnapshot>) -> Vec<String> {
        let mut shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());

        if orgs.is_empty() {
            shards.remove(parent_queue_key);
            return Vec::new();
        }
        let state = shards.entry(parent_queue_key.to_string()).or_default();

        let max_limit = orgs
            .iter()
            .filter_map(|o| o.concurrency.map(|c| c.limit))
            .max()
            .unwrap_or(0);

        state
            .deficits
            .retain(|org_id, _| orgs.iter().any(|o| &o.org_id == org_id));

        let mut pending: Vec<(String, Vec<String>)> = Vec::with_capacity(orgs.len());
        for org in orgs {
            let credit = self.config.quantum * self.weight(&org, max_limit);
            let deficit = state.deficits.entry(org.org_id.clone()).or_insert(0.0);
            *deficit = (*deficit + credit).min(self.config.max_deficit);

            let queues: Vec<String> = org
                .envs
                .into_iter()
                .flat_map(|env| env.queues.into_iter().map(|q| q.queue_id))
                .collect();
            pending.push((org.org_id, queues));
        }

        // Id order rotated by round, then highest deficit first.
        pending.sort_by(|(a, _), (b, _)| a.cmp(b));
        let rotation = state.round % pending.len();
        pending.rotate_left(rotation);
        pending.sort_by(|(a, _), (b, _)| {
            let da = state.deficits.get(a).copied().unwrap_or(0.0);
            let db = state.deficits.get(b).copied().unwrap_or(0.0);
            db.total_cmp(&da)
        });
        state.round = state.round.wrapping_add(1);

        let limit = self.config.parent_queue_limit;
        let mut cursors = vec![0usize; pending.len()];
        let mut ordered = Vec::new();
        'passes: loop {
            let mut progressed = false;
            for (idx, (org_id, queues)) in pending.iter().enumerate() {
                if cursors[idx] >= queues.len() {
                    continue;
                }
                let Some(deficit) = state.deficits.get_mut(org_id) else {
                    continue;
                };
                if *deficit < QUEUE_COST {
                    continue;
                }
                *deficit -= QUEUE_COST;
                ordered.push(queues[cursors[idx]].clone());
                cursors[idx] += 1;
                progressed = true;
                if ordered.len() >= limit {
                    break 'passes;
                }
            }
            if !progressed {
                break;
            }
        }

        // Nobody could afford a queue: serve the best-credited org anyway.
        if ordered.is_empty() {
            if let Some((org_id, queues)) = pending.iter().find(|(_, q)| !q.is_empty()) {
                if let Some(deficit) = state.deficits.get_mut(org_id) {
                    *deficit = (*deficit - QUEUE_COST).max(0.0);
                }
                ordered.push(queues[0].clone());
                if let Some(idx) = pending.iter().position(|(id, _)| id == org_id) {
                    cursors[idx] = 1;
                }
            }
        }

        for (idx, (org_id, queues)) in pending.iter().enumerate() {
            if cursors[idx] >= queues.len() {
                state.deficits.insert(org_id.clone(), 0.0);
            }
        }

        trace!(
            parent_queue_key,
            orgs = pending.len(),
            queues = ordered.len(),
            round = state.round,
            "DRR pass complete"
        );
        ordered
    }

    fn weight(&self, org: &OrgSnapshot, max_limit: u64) -> f64 {
        if !self.config.limit_weighted || max_limit == 0 {
            return 1.0;
        }
        match org.concurrency {
            Some(c) => (c.limit as f64 / max_limit as f64).max(0.01),
            None => 1.0,
        }
    }
}

#[async_trait]
impl QueueScheduler for DrrScheduler {
    async fn select_queues(
        &self,
        parent_queue_key: &str,
        _consumer_id: &str,
        ctx: &dyn SchedulerContext,
    ) -> Result<Vec<String>, QueueError> {
        let orgs = admitted_snapshot(
            ctx,
            parent_queue_key,
            now_ms(),
            self.config.parent_queue_limit,
        )
        .await?;
        Ok(self.schedule(parent_queue_key, orgs))
    }

    fn cache_size(&self) -> usize {
        self.shards
            .lock()
            .map(|shards| shards.values().map(|s| s.deficits.len()).sum())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencySnapshot;
    use crate::scheduler::testing::StaticContext;
    use crate::scheduler::{EnvSnapshot, QueueCandidate};

    const SHARD: &str = "master:0";

    fn org(org_id: &str, queue_count: usize, limit: Option<u64>) -> OrgSnapshot {
        OrgSnapshot {
            org_id: org_id.to_string(),
            concurrency: limit.map(|limit| ConcurrencySnapshot { current: 0, limit }),
            envs: vec![EnvSnapshot {
                env_id: "prod".to_string(),
                concurrency: None,
                queues: (0..queue_count)
                    .map(|i| QueueCandidate::new(format!("org:{org_id}:env:prod:queue:{i}"), 0))
                    .collect(),
            }],
        }
    }

    fn org_of(queue_id: &str) -> &str {
        queue_id.split(':').nth(1).unwrap_or_default()
    }

    #[test]
    fn test_one_queue_per_org_per_quantum() {
        let scheduler = DrrScheduler::new(DrrConfig::default());
        let ordered = scheduler.schedule(SHARD, vec![org("a", 5, None), org("b", 1, None)]);

        assert_eq!(ordered.len(), 2);
        let orgs: Vec<&str> = ordered.iter().map(|q| org_of(q)).collect();
        assert!(orgs.contains(&"a"));
        assert!(orgs.contains(&"b"));
    }

    #[test]
    fn test_first_position_rotates_among_equal_orgs() {
        let scheduler = DrrScheduler::new(DrrConfig::default());
        let mut first: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let ordered = scheduler.schedule(SHARD, vec![org("a", 1, None), org("b", 1, None), org("c", 1, None)]);
            *first.entry(org_of(&ordered[0]).to_string()).or_default() += 1;
        }
        assert_eq!(first.len(), 3);
        for count in first.values() {
            assert_eq!(*count, 100);
        }
    }

    #[test]
    fn test_unserved_deficit_accumulates_and_is_capped() {
        let scheduler = DrrScheduler::new(
            DrrConfig::default()
                .with_max_deficit(3.0)
                .with_parent_queue_limit(1),
        );
        for _ in 0..10 {
            scheduler.schedule(SHARD, vec![org("a", 2, None), org("b", 2, None)]);
        }
        let a = scheduler.deficit(SHARD, "a").expect("a tracked");
        let b = scheduler.deficit(SHARD, "b").expect("b tracked");
        assert!(a <= 3.0 && b <= 3.0);
        assert!(a.max(b) >= 2.0);
    }

    #[test]
    fn test_inactive_orgs_are_forgotten() {
        let scheduler = DrrScheduler::new(DrrConfig::default());
        scheduler.schedule(SHARD, vec![org("a", 3, None), org("b", 3, None)]);
        assert_eq!(scheduler.cache_size(), 2);

        scheduler.schedule(SHARD, vec![org("b", 3, None)]);
        assert!(scheduler.deficit(SHARD, "a").is_none());
        assert_eq!(scheduler.cache_size(), 1);

        scheduler.schedule(SHARD, Vec::new());
        assert_eq!(scheduler.cache_size(), 0);
    }

    #[test]
    fn test_drained_org_forfeits_deficit() {
        let scheduler = DrrScheduler::new(DrrConfig::default().with_quantum(5.0));
        scheduler.schedule(SHARD, vec![org("a", 1, None)]);
        assert_eq!(scheduler.deficit(SHARD, "a"), Some(0.0));
    }

    #[test]
    fn test_limit_weighted_quantum() {
        let scheduler = DrrScheduler::new(
            DrrConfig::default()
                .with_quantum(4.0)
                .with_limit_weighted(true),
        );
        let ordered = scheduler.schedule(SHARD, vec![org("big", 10, Some(100)), org("small", 10, Some(25))]);

        let big = ordered.iter().filter(|q| org_of(q) == "big").count();
        let small = ordered.iter().filter(|q| org_of(q) == "small").count();
        assert_eq!(big, 4);
        assert_eq!(small, 1);
    }

    #[test]
    fn test_deficit_carries_across_interleaved_shards() {
        let scheduler = DrrScheduler::new(DrrConfig::default().with_limit_weighted(true));

        let mut small_served = 0;
        for _ in 0..40 {
            let ordered = scheduler.schedule(
                "master:0",
                vec![org("big", 10, Some(100)), org("small", 10, Some(25))],
            );
            small_served += ordered.iter().filter(|q| org_of(q) == "small").count();

            let other = scheduler.schedule("master:1", vec![org("other", 3, Some(10))]);
            assert_eq!(other.len(), 1);
        }

        assert_eq!(small_served, 10);
        assert!(scheduler.deficit("master:0", "small").is_some());
        assert!(scheduler.deficit("master:1", "small").is_none());
    }

    #[test]
    fn test_empty_shard_keeps_other_shards_state() {
        let scheduler = DrrScheduler::new(DrrConfig::default().with_quantum(0.5));
        scheduler.schedule("master:0", vec![org("a", 3, None), org("b", 3, None)]);
        scheduler.schedule("master:1", Vec::new());

        assert!(scheduler.deficit("master:0", "a").is_some());
        assert_eq!(scheduler.cache_size(), 2);
    }

    #[test]
    fn test_never_idle_when_work_exists() {
        let scheduler = DrrScheduler::new(DrrConfig::default().with_quantum(0.25));
        let ordered = scheduler.schedule(SHARD, vec![org("a", 2, None)]);
        assert_eq!(ordered.len(), 1);
    }

    #[tokio::test]
    async fn test_select_queues_respects_admission() {
        let scheduler = DrrScheduler::new(DrrConfig::default());
        let ctx = StaticContext::default()
            .with_queue("a", "prod", "q", 0)
            .with_queue("b", "prod", "q", 0)
            .with_org_limit("a", 4, 4);

        let ordered = scheduler
            .select_queues("master:0", "c", &ctx)
            .await
            .expect("schedule");
        assert_eq!(ordered, vec!["org:b:env:prod:queue:q".to_string()]);
    }
}
