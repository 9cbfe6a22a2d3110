//! Statistical fairness checks for the schedulers over an in-memory context.

use std::collections::HashMap;

use async_trait::async_trait;
use fairq::concurrency::ConcurrencySnapshot;
use fairq::scheduler::{
    DrrConfig, DrrScheduler, FairDequeuingConfig, FairDequeuingStrategy, QueueCandidate,
    QueueScheduler, SchedulerContext,
};
use fairq::store::now_ms;
use fairq::QueueError;

#[derive(Default)]
struct MemoryContext {
    queues: Vec<QueueCandidate>,
    orgs: HashMap<String, ConcurrencySnapshot>,
}

impl MemoryContext {
    fn queue(mut self, org: &str, name: &str, age_ms: i64) -> Self {
        self.queues.push(QueueCandidate::new(
            format!("org:{org}:env:prod:queue:{name}"),
            now_ms() - age_ms,
        ));
        self
    }

    fn org_limit(mut self, org: &str, current: u64, limit: u64) -> Self {
        self.orgs
            .insert(org.to_string(), ConcurrencySnapshot { current, limit });
        self
    }
}

#[async_trait]
impl SchedulerContext for MemoryContext {
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
        _org_id: &str,
        _env_id: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
        Ok(None)
    }
}

fn org_of(queue_id: &str) -> &str {
    queue_id.split(':').nth(1).unwrap_or_default()
}

async fn first_position_counts(
    scheduler: &dyn QueueScheduler,
    ctx: &dyn SchedulerContext,
    rounds: usize,
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..rounds {
        let queues = scheduler
            .select_queues("master:0", "consumer-0", ctx)
            .await
            .expect("scheduling should succeed");
        if let Some(first) = queues.first() {
            *counts.entry(org_of(first).to_string()).or_insert(0) += 1;
        }
    }
    counts
}

fn three_equal_orgs() -> MemoryContext {
    MemoryContext::default()
        .queue("a", "q1", 5_000)
        .queue("a", "q2", 4_000)
        .queue("b", "q1", 5_000)
        .queue("b", "q2", 4_000)
        .queue("c", "q1", 5_000)
        .queue("c", "q2", 4_000)
        .org_limit("a", 0, 10)
        .org_limit("b", 0, 10)
        .org_limit("c", 0, 10)
}

#[tokio::test]
async fn test_equal_orgs_share_first_position() {
    let ctx = three_equal_orgs();
    let strategy = FairDequeuingStrategy::new(FairDequeuingConfig::default().with_seed(2024));

    let rounds = 1_000;
    let counts = first_position_counts(&strategy, &ctx, rounds).await;

    let fractions: Vec<f64> = ["a", "b", "c"]
        .iter()
        .map(|org| *counts.get(*org).unwrap_or(&0) as f64 / rounds as f64)
        .collect();
    for fraction in &fractions {
        assert!(
            (fraction - 1.0 / 3.0).abs() < 0.3 / 3.0,
            "first-position share {fraction} too far from a third: {counts:?}"
        );
    }

    let mean = fractions.iter().sum::<f64>() / fractions.len() as f64;
    let variance =
        fractions.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / fractions.len() as f64;
    assert!(variance.sqrt() < 0.05, "std dev {} too high", variance.sqrt());
}

#[tokio::test]
async fn test_maximum_org_count_prefers_oldest_orgs() {
    let ctx = MemoryContext::default()
        .queue("fresh", "q", 1_000)
        .queue("recent", "q", 5_000)
        .queue("stale", "q", 20_000)
        .queue("ancient", "q", 60_000);
    let strategy = FairDequeuingStrategy::new(
        FairDequeuingConfig::default()
            .with_maximum_org_count(2)
            .with_seed(9),
    );

    let rounds = 200;
    let mut selected: HashMap<String, usize> = HashMap::new();
    for _ in 0..rounds {
        let queues = strategy
            .select_queues("master:0", "consumer-0", &ctx)
            .await
            .expect("scheduling should succeed");
        for queue in &queues {
            *selected.entry(org_of(queue).to_string()).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(&String, &usize)> = selected.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top: Vec<&str> = ranked.iter().take(2).map(|(org, _)| org.as_str()).collect();
    assert!(top.contains(&"ancient") && top.contains(&"stale"), "top orgs {top:?}");

    let fresh = *selected.get("fresh").unwrap_or(&0) as f64 / rounds as f64;
    assert!(fresh < 0.2, "youngest org selected in {fresh} of rounds");
}

#[tokio::test]
async fn test_org_at_limit_is_never_selected() {
    let ctx = three_equal_orgs().org_limit("b", 10, 10);
    let fair = FairDequeuingStrategy::new(FairDequeuingConfig::default().with_seed(5));
    let drr = DrrScheduler::new(DrrConfig::default());

    for scheduler in [&fair as &dyn QueueScheduler, &drr as &dyn QueueScheduler] {
        for _ in 0..100 {
            let queues = scheduler
                .select_queues("master:0", "consumer-0", &ctx)
                .await
                .expect("scheduling should succeed");
            assert!(!queues.is_empty());
            assert!(queues.iter().all(|q| org_of(q) != "b"), "selected {queues:?}");
        }
    }
}

#[tokio::test]
async fn test_drr_rotates_first_position_evenly() {
    let ctx = three_equal_orgs();
    let drr = DrrScheduler::new(DrrConfig::default());

    let rounds = 300;
    let counts = first_position_counts(&drr, &ctx, rounds).await;
    for org in ["a", "b", "c"] {
        assert_eq!(counts.get(org), Some(&100), "counts {counts:?}");
    }
}
