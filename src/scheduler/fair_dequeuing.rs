//! Concurrency-aware, age-biased weighted shuffling of queues.
//!
//! One scheduling pass:
//!
//! 1. Read up to `parent_queue_limit` ready queues from the master index.
//! 2. Group them by org, then env; drop orgs/envs at their concurrency limit.
//! 3. If `maximum_org_count` is set, keep the orgs whose queues have waited
//!    longest on average.
//! 4. Shuffle orgs, then envs inside each org, with a seeded weighted
//!    shuffle. Weights favour higher limits (`concurrency_limit_bias`) and
//!    more headroom (`available_capacity_bias`).
//! 5. Order queues inside an env by age, blended with noise by
//!    `queue_age_randomization` (0 = strictly oldest first).
//! 6. Flatten and truncate.
//!
//! With `reuse_snapshot_count = N` a consumer gets the same ordering for the
//! next N calls without any store access.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use super::{admitted_snapshot, OrgSnapshot, QueueCandidate, QueueScheduler, SchedulerContext};
use crate::concurrency::ConcurrencySnapshot;
use crate::error::QueueError;
use crate::store::now_ms;

/// Floor for selection weights so nothing is shuffled out entirely.
const MIN_WEIGHT: f64 = 0.01;

/// Tunables for the weighted shuffle, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerBiases {
    /// How strongly higher concurrency limits are favoured.
    pub concurrency_limit_bias: f64,
    /// How strongly more remaining capacity is favoured.
    pub available_capacity_bias: f64,
    /// 0 = queues within an env strictly oldest first, 1 = uniformly random.
    pub queue_age_randomization: f64,
}

impl Default for SchedulerBiases {
    fn default() -> Self {
        Self {
            concurrency_limit_bias: 0.75,
            available_capacity_bias: 0.3,
            queue_age_randomization: 0.25,
        }
    }
}

impl SchedulerBiases {
    /// No bias and strict age order: a plain uniform shuffle of orgs and envs.
    pub fn neutral() -> Self {
        Self {
            concurrency_limit_bias: 0.0,
            available_capacity_bias: 0.0,
            queue_age_randomization: 0.0,
        }
    }

    fn clamped(self) -> Self {
        Self {
            concurrency_limit_bias: self.concurrency_limit_bias.clamp(0.0, 1.0),
            available_capacity_bias: self.available_capacity_bias.clamp(0.0, 1.0),
            queue_age_randomization: self.queue_age_randomization.clamp(0.0, 1.0),
        }
    }
}

/// Configuration for [`FairDequeuingStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct FairDequeuingConfig {
    /// Maximum candidate queues read per pass, and maximum returned.
    pub parent_queue_limit: usize,
    /// Cap on distinct orgs per pass; `None` is unlimited.
    pub maximum_org_count: Option<usize>,
    pub biases: SchedulerBiases,
    /// Calls per consumer that reuse the last ordering before recomputing.
    pub reuse_snapshot_count: u32,
    /// Random seed for reproducibility (None = non-deterministic).
    pub seed: Option<u64>,
}

impl Default for FairDequeuingConfig {
    fn default() -> Self {
        Self {
            parent_queue_limit: 100,
            maximum_org_count: None,
            biases: SchedulerBiases::default(),
            reuse_snapshot_count: 0,
            seed: None,
        }
    }
}

impl FairDequeuingConfig {
    pub fn with_parent_queue_limit(mut self, limit: usize) -> Self {
        self.parent_queue_limit = limit.max(1);
        self
    }

    pub fn with_maximum_org_count(mut self, count: usize) -> Self {
        self.maximum_org_count = Some(count);
        self
    }

    pub fn with_biases(mut self, biases: SchedulerBiases) -> Self {
        self.biases = biases;
        self
    }

    pub fn with_reuse_snapshot_count(mut self, count: u32) -> Self {
        self.reuse_snapshot_count = count;
        self
    }

    /// Sets a random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug)]
struct CachedOrdering {
    queues: Vec<String>,
    remaining_reuses: u32,
}

/// Fair dequeuing scheduler.
pub struct FairDequeuingStrategy {
    config: FairDequeuingConfig,
    rng: Mutex<ChaCha8Rng>,
    snapshots: Mutex<HashMap<String, CachedOrdering>>,
}

impl FairDequeuingStrategy {
    pub fn new(config: FairDequeuingConfig) -> Self {
        let rng = create_rng(config.seed);
        Self {
            config: FairDequeuingConfig {
                biases: config.biases.clamped(),
                ..config
            },
            rng: Mutex::new(rng),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FairDequeuingConfig {
        &self.config
    }

    /// Ordered queue ids for `consumer_id` to service next.
    pub async fn distribute_fair_queues_from_parent_queue(
        &self,
        parent_queue_key: &str,
        consumer_id: &str,
        ctx: &dyn SchedulerContext,
    ) -> Result<Vec<String>, QueueError> {
        if let Some(reused) = self.reuse_snapshot(consumer_id) {
            trace!(consumer_id = %consumer_id, queues = reused.len(), "Reusing scheduling snapshot");
            return Ok(reused);
        }

        let now = now_ms();
        let orgs =
            admitted_snapshot(ctx, parent_queue_key, now, self.config.parent_queue_limit).await?;
        if orgs.is_empty() {
            return Ok(Vec::new());
        }

        let ordered = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            order_snapshot(orgs, now, &self.config, &mut *rng)
        };

        if self.config.reuse_snapshot_count > 0 {
            let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
            snapshots.insert(
                consumer_id.to_string(),
                CachedOrdering {
                    queues: ordered.clone(),
                    remaining_reuses: self.config.reuse_snapshot_count,
                },
            );
        }

        Ok(ordered)
    }

    fn reuse_snapshot(&self, consumer_id: &str) -> Option<Vec<String>> {
        if self.config.reuse_snapshot_count == 0 {
            return None;
        }
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let cached = snapshots.get_mut(consumer_id)?;
        if cached.remaining_reuses == 0 {
            snapshots.remove(consumer_id);
            return None;
        }
        cached.remaining_reuses -= 1;
        Some(cached.queues.clone())
    }
}

#[async_trait]
impl QueueScheduler for FairDequeuingStrategy {
    async fn select_queues(
        &self,
        parent_queue_key: &str,
        consumer_id: &str,
        ctx: &dyn SchedulerContext,
    ) -> Result<Vec<String>, QueueError> {
        self.distribute_fair_queues_from_parent_queue(parent_queue_key, consumer_id, ctx)
            .await
    }

    fn cache_size(&self) -> usize {
        self.snapshots
            .lock()
            .map(|s| s.len())
            .unwrap_or_default()
    }
}

/// Creates a random number generator.
fn create_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

/// Orders an admitted snapshot into a flat list of queue ids.
///
/// Pure apart from the RNG: the same snapshot, config and RNG state always
/// produce the same list.
pub fn order_snapshot<R: RngExt>(
    mut orgs: Vec<OrgSnapshot>,
    now_ms: i64,
    config: &FairDequeuingConfig,
    rng: &mut R,
) -> Vec<String> {
    if let Some(max_orgs) = config.maximum_org_count {
        if max_orgs > 0 && orgs.len() > max_orgs {
            orgs = oldest_orgs(orgs, now_ms, max_orgs);
        }
    }

    let biases = config.biases;
    let org_weights = weights_for(orgs.iter().map(|o| o.concurrency), biases);
    let orgs = weighted_shuffle(orgs, &org_weights, rng);

    let mut ordered = Vec::new();
    for org in orgs {
        let env_weights = weights_for(org.envs.iter().map(|e| e.concurrency), biases);
        let envs = weighted_shuffle(org.envs, &env_weights, rng);
        for env in envs {
            let queues = order_by_age(env.queues, biases.queue_age_randomization, rng);
            ordered.extend(queues.into_iter().map(|q| q.queue_id));
            if ordered.len() >= config.parent_queue_limit {
                ordered.truncate(config.parent_queue_limit);
                return ordered;
            }
        }
    }
    ordered
}

/// Keeps the `count` orgs with the highest mean queue age, ties by org id.
fn oldest_orgs(orgs: Vec<OrgSnapshot>, now_ms: i64, count: usize) -> Vec<OrgSnapshot> {
    let mut ranked: Vec<(f64, OrgSnapshot)> = orgs
        .into_iter()
        .map(|org| (org.average_age_ms(now_ms), org))
        .collect();
    ranked.sort_by(|(age_a, org_a), (age_b, org_b)| {
        age_b
            .total_cmp(age_a)
            .then_with(|| org_a.org_id.cmp(&org_b.org_id))
    });
    ranked.truncate(count);
    ranked.into_iter().map(|(_, org)| org).collect()
}

/// Selection weight of each entry relative to its siblings.
///
/// `w = (1 - cb + cb * L/Lmax) * (1 - ab + ab * A/Amax)`, where L is the
/// entry's limit and A its remaining capacity. Unlimited entries count as
/// maximal on both axes.
fn weights_for<I>(concurrency: I, biases: SchedulerBiases) -> Vec<f64>
where
    I: Iterator<Item = Option<ConcurrencySnapshot>>,
{
    let concurrency: Vec<Option<ConcurrencySnapshot>> = concurrency.collect();
    let max_limit = concurrency
        .iter()
        .flatten()
        .map(|c| c.limit)
        .max()
        .unwrap_or(0);
    let max_available = concurrency
        .iter()
        .flatten()
        .map(|c| c.available())
        .max()
        .unwrap_or(0);

    concurrency
        .iter()
        .map(|c| {
            let (limit_ratio, capacity_ratio) = match c {
                Some(c) => (
                    ratio(c.limit, max_limit),
                    ratio(c.available(), max_available),
                ),
                None => (1.0, 1.0),
            };
            let cb = biases.concurrency_limit_bias;
            let ab = biases.available_capacity_bias;
            let weight = (1.0 - cb + cb * limit_ratio) * (1.0 - ab + ab * capacity_ratio);
            weight.max(MIN_WEIGHT)
        })
        .collect()
}

fn ratio(value: u64, max: u64) -> f64 {
    if max == 0 {
        1.0
    } else {
        value as f64 / max as f64
    }
}

/// Weighted random permutation (Efraimidis-Spirakis): each item draws
/// `u^(1/w)` and items are sorted by that key, largest first.
fn weighted_shuffle<T, R: RngExt>(items: Vec<T>, weights: &[f64], rng: &mut R) -> Vec<T> {
    let mut keyed: Vec<(f64, T)> = items
        .into_iter()
        .zip(weights.iter().copied())
        .map(|(item, weight)| {
            let u: f64 = rng.random();
            (u.powf(1.0 / weight), item)
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    keyed.into_iter().map(|(_, item)| item).collect()
}

/// Orders an env's queues (already oldest first) by age blended with noise.
fn order_by_age<R: RngExt>(
    queues: Vec<QueueCandidate>,
    randomization: f64,
    rng: &mut R,
) -> Vec<QueueCandidate> {
    if randomization <= 0.0 || queues.len() < 2 {
        return queues;
    }

    let count = queues.len() as f64;
    let mut keyed: Vec<(f64, QueueCandidate)> = queues
        .into_iter()
        .enumerate()
        .map(|(rank, queue)| {
            let age_score = 1.0 - rank as f64 / count;
            let noise: f64 = rng.random();
            ((1.0 - randomization) * age_score + randomization * noise, queue)
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    keyed.into_iter().map(|(_, queue)| queue).collect()
}
