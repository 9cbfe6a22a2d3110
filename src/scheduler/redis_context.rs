//! Redis-backed [`SchedulerContext`].

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{QueueCandidate, SchedulerContext};
use crate::concurrency::{env_group_key, ConcurrencyManager, ConcurrencyScope, ConcurrencySnapshot};
use crate::error::QueueError;

/// Reads the master index and the org/env concurrency groups.
///
/// Org and env limits only apply when a group with that scope is configured
/// on the [`ConcurrencyManager`].
pub struct RedisSchedulerContext {
    redis: ConnectionManager,
    concurrency: Arc<ConcurrencyManager>,
}

impl RedisSchedulerContext {
    pub fn new(redis: ConnectionManager, concurrency: Arc<ConcurrencyManager>) -> Self {
        Self { redis, concurrency }
    }

    async fn scoped_snapshot(
        &self,
        scope: ConcurrencyScope,
        group_key: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
        let Some(group) = self.concurrency.group_for_scope(scope) else {
            return Ok(None);
        };
        let snapshot = self.concurrency.snapshot(group, group_key).await?;
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl SchedulerContext for RedisSchedulerContext {
    async fn ready_queues(
        &self,
        parent_queue_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueCandidate>, QueueError> {
        let mut conn = self.redis.clone();
        // Equal scores come back in member order.
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(parent_queue_key, "-inf", now_ms, 0, limit as isize)
            .await?;

        Ok(entries
            .into_iter()
            .map(|(queue_id, score)| QueueCandidate::new(queue_id, score as i64))
            .collect())
    }

    async fn org_concurrency(
        &self,
        org_id: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
        self.scoped_snapshot(ConcurrencyScope::Org, org_id).await
    }

    async fn env_concurrency(
        &self,
        org_id: &str,
        env_id: &str,
    ) -> Result<Option<ConcurrencySnapshot>, QueueError> {
        self.scoped_snapshot(ConcurrencyScope::Env, &env_group_key(org_id, env_id))
            .await
    }
}
