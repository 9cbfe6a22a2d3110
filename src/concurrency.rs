//! Concurrency groups: store-side reservations that cap parallel work.
//!
//! Each configured group maps a message's queue to a group key (its tenant,
//! org, env or queue) and caps how many messages holding that key may be in
//! process at once. A reservation is the message id's membership in the
//! group key's set, so:
//!
//! - reserving checks capacity and adds the member in one script
//!   (no client-side locking),
//! - releasing is `SREM`, which is idempotent; releasing twice can never
//!   push the count below the true usage.
//!
//! The scheduler only reads these sets. Between its read and a claim another
//! consumer may reserve, so the limit can be briefly overshot by the
//! read path, but never by the reservation itself.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::keys::KeyProducer;
use crate::queue::message::QueueDescriptor;

/// KEYS: (set, limitOverride) pairs. ARGV: member, then one default limit per pair.
/// Returns 0 on success or the 1-based index of the first group at its limit.
const RESERVE: &str = r#"
local member = ARGV[1]
local groups = #KEYS / 2
for i = 1, groups do
  local setKey = KEYS[2 * i - 1]
  if redis.call('SISMEMBER', setKey, member) == 0 then
    local limit = tonumber(redis.call('GET', KEYS[2 * i]) or ARGV[i + 1])
    if redis.call('SCARD', setKey) >= limit then
      return i
    end
  end
end
for i = 1, groups do
  redis.call('SADD', KEYS[2 * i - 1], member)
end
return 0
"#;

/// What a concurrency group is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyScope {
    Tenant,
    Org,
    Env,
    Queue,
}

impl ConcurrencyScope {
    /// Whether the group key comes from the queue id alone.
    pub fn is_queue_derived(self) -> bool {
        !matches!(self, ConcurrencyScope::Tenant)
    }
}

/// A named concurrency group with its default limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyGroupConfig {
    pub name: String,
    pub scope: ConcurrencyScope,
    /// Limit applied when no explicit override is stored for a group key.
    pub default_limit: u64,
}

impl ConcurrencyGroupConfig {
    pub fn new(name: impl Into<String>, scope: ConcurrencyScope, default_limit: u64) -> Self {
        Self {
            name: name.into(),
            scope,
            default_limit,
        }
    }

    pub fn tenant(default_limit: u64) -> Self {
        Self::new("tenant", ConcurrencyScope::Tenant, default_limit)
    }

    pub fn org(default_limit: u64) -> Self {
        Self::new("org", ConcurrencyScope::Org, default_limit)
    }

    pub fn env(default_limit: u64) -> Self {
        Self::new("env", ConcurrencyScope::Env, default_limit)
    }

    pub fn queue(default_limit: u64) -> Self {
        Self::new("queue", ConcurrencyScope::Queue, default_limit)
    }

    /// Group key of a queue, or `None` if the queue id lacks the needed part.
    pub fn group_key(&self, queue: &QueueDescriptor) -> Option<String> {
        match self.scope {
            ConcurrencyScope::Tenant => Some(queue.tenant_id.clone()),
            ConcurrencyScope::Org => queue.org_id.clone(),
            ConcurrencyScope::Env => {
                let org = queue.org_id.as_deref()?;
                let env = queue.env_id.as_deref()?;
                Some(env_group_key(org, env))
            }
            ConcurrencyScope::Queue => Some(queue.queue_id.clone()),
        }
    }
}

/// Env ids are only unique within an org.
pub fn env_group_key(org_id: &str, env_id: &str) -> String {
    format!("{org_id}:{env_id}")
}

/// Current usage and limit of one group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySnapshot {
    pub current: u64,
    pub limit: u64,
}

impl ConcurrencySnapshot {
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    pub fn is_at_limit(&self) -> bool {
        self.current >= self.limit
    }
}

/// Outcome of reserving a message in every group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The named group is at its limit; nothing was reserved.
    Rejected { group: String },
}

/// Reads and mutates concurrency reservations in Redis.
pub struct ConcurrencyManager {
    redis: ConnectionManager,
    keys: Arc<dyn KeyProducer>,
    groups: Vec<ConcurrencyGroupConfig>,
    reserve_script: Script,
}

impl ConcurrencyManager {
    pub fn new(
        redis: ConnectionManager,
        keys: Arc<dyn KeyProducer>,
        groups: Vec<ConcurrencyGroupConfig>,
    ) -> Self {
        Self {
            redis,
            keys,
            groups,
            reserve_script: Script::new(RESERVE),
        }
    }

    pub fn groups(&self) -> &[ConcurrencyGroupConfig] {
        &self.groups
    }

    /// First configured group with the given scope.
    pub fn group_for_scope(&self, scope: ConcurrencyScope) -> Option<&ConcurrencyGroupConfig> {
        self.groups.iter().find(|g| g.scope == scope)
    }

    /// Usage and effective limit of one group key.
    pub async fn snapshot(
        &self,
        group: &ConcurrencyGroupConfig,
        group_key: &str,
    ) -> Result<ConcurrencySnapshot, QueueError> {
        let mut conn = self.redis.clone();
        let (current, override_limit): (u64, Option<u64>) = redis::pipe()
            .scard(self.keys.concurrency_key(&group.name, group_key))
            .get(self.keys.concurrency_limit_key(&group.name, group_key))
            .query_async(&mut conn)
            .await?;

        Ok(ConcurrencySnapshot {
            current,
            limit: override_limit.unwrap_or(group.default_limit),
        })
    }

    /// Smallest remaining capacity for a queue across the groups keyed by
    /// its id (org, env, queue).
    ///
    /// Tenant groups are left out: a message's tenant is only known once it
    /// is claimed, and [`reserve`](Self::reserve) enforces them per message.
    /// `None` means no group applies, i.e. unlimited.
    pub async fn queue_capacity(&self, queue_id: &str) -> Result<Option<u64>, QueueError> {
        let queue = QueueDescriptor::new(queue_id, "");
        let mut available: Option<u64> = None;
        for group in self.groups.iter().filter(|g| g.scope.is_queue_derived()) {
            let Some(group_key) = group.group_key(&queue) else {
                continue;
            };
            let snapshot = self.snapshot(group, &group_key).await?;
            available = Some(match available {
                Some(current) => current.min(snapshot.available()),
                None => snapshot.available(),
            });
        }
        Ok(available)
    }

    /// Reserves a slot for `message_id` in every group, all or nothing.
    ///
    /// Reserving a message that already holds its slots is a no-op success.
    pub async fn reserve(
        &self,
        queue: &QueueDescriptor,
        message_id: &str,
    ) -> Result<Reservation, QueueError> {
        let applicable: Vec<(&ConcurrencyGroupConfig, String)> = self
            .groups
            .iter()
            .filter_map(|g| g.group_key(queue).map(|key| (g, key)))
            .collect();
        if applicable.is_empty() {
            return Ok(Reservation::Reserved);
        }

        let mut invocation = self.reserve_script.prepare_invoke();
        for (group, key) in &applicable {
            invocation
                .key(self.keys.concurrency_key(&group.name, key))
                .key(self.keys.concurrency_limit_key(&group.name, key));
        }
        invocation.arg(message_id);
        for (group, _) in &applicable {
            invocation.arg(group.default_limit);
        }

        let mut conn = self.redis.clone();
        let rejected_at: i64 = invocation.invoke_async(&mut conn).await?;
        if rejected_at == 0 {
            return Ok(Reservation::Reserved);
        }

        let group = applicable
            .get(rejected_at as usize - 1)
            .map(|(g, _)| g.name.clone())
            .unwrap_or_default();
        Ok(Reservation::Rejected { group })
    }

    /// Drops `message_id` from every group. Idempotent.
    pub async fn release(
        &self,
        queue: &QueueDescriptor,
        message_id: &str,
    ) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut any = false;
        for group in &self.groups {
            if let Some(key) = group.group_key(queue) {
                pipe.srem(self.keys.concurrency_key(&group.name, &key), message_id)
                    .ignore();
                any = true;
            }
        }
        if !any {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Stores an explicit limit for one group key, overriding the default.
    pub async fn set_limit(
        &self,
        group: &str,
        group_key: &str,
        limit: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.keys.concurrency_limit_key(group, group_key), limit)
            .await?;
        Ok(())
    }

    /// Removes an explicit limit so the group default applies again.
    pub async fn clear_limit(&self, group: &str, group_key: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.keys.concurrency_limit_key(group, group_key))
            .await?;
        Ok(())
    }

    /// Current usage of one group key.
    pub async fn current(&self, group: &str, group_key: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let count: u64 = conn.scard(self.keys.concurrency_key(group, group_key)).await?;
        Ok(count)
    }
}
