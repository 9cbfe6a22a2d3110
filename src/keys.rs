//! Mapping from logical identifiers to Redis key strings.
//!
//! Queue ids follow the convention `org:{orgId}:env:{envId}:queue:{queueName}`.
//! Every structure the queue touches lives under a configurable prefix:
//!
//! - `{prefix}:{queueId}`: ready messages (sorted set, score = ready-at ms)
//! - `{prefix}:{queueId}:items`: message bodies (hash)
//! - `{prefix}:master:{shard}`: queues with pending work (sorted set, score = oldest ready-at)
//! - `{prefix}:inflight:{shard}`: claimed messages (sorted set, score = deadline ms)
//! - `{prefix}:inflight:{shard}:data`: claimed message bodies (hash)
//! - `{prefix}:dlq:{tenant}` / `{prefix}:dlq:{tenant}:data`: dead letters
//! - `{prefix}:concurrency:{group}:{key}`: reservation sets
//! - `{prefix}:lock:{resource}`: run locks

use sha2::{Digest, Sha256};

/// Default prefix for every key written by fairq.
pub const DEFAULT_KEY_PREFIX: &str = "fairq";

const ORG_SEGMENT: &str = "org";
const ENV_SEGMENT: &str = "env";
const QUEUE_SEGMENT: &str = "queue";

/// Produces store keys and extracts identifiers back out of queue ids.
///
/// Implementations must be pure: the same inputs always yield the same key.
/// Extraction functions never panic; malformed ids yield `None`.
pub trait KeyProducer: Send + Sync {
    /// Composes a queue id from its parts.
    fn queue_id(&self, org_id: &str, env_id: &str, queue_name: &str) -> String {
        format!("{ORG_SEGMENT}:{org_id}:{ENV_SEGMENT}:{env_id}:{QUEUE_SEGMENT}:{queue_name}")
    }

    fn queue_key(&self, queue_id: &str) -> String;
    fn queue_items_key(&self, queue_id: &str) -> String;
    fn master_queue_key(&self, shard: u32) -> String;
    fn inflight_key(&self, shard: u32) -> String;
    fn inflight_data_key(&self, shard: u32) -> String;
    fn dead_letter_key(&self, tenant_id: &str) -> String;
    fn dead_letter_data_key(&self, tenant_id: &str) -> String;
    fn concurrency_key(&self, group: &str, group_key: &str) -> String;
    fn concurrency_limit_key(&self, group: &str, group_key: &str) -> String;
    fn lock_key(&self, resource: &str) -> String;

    fn org_id_from_queue(&self, queue_id: &str) -> Option<String> {
        parse_queue_id(queue_id).map(|parts| parts.org_id.to_string())
    }

    fn env_id_from_queue(&self, queue_id: &str) -> Option<String> {
        parse_queue_id(queue_id).map(|parts| parts.env_id.to_string())
    }

    fn queue_name_from_queue(&self, queue_id: &str) -> Option<String> {
        parse_queue_id(queue_id).map(|parts| parts.queue_name.to_string())
    }

    /// Tenant that owns a queue when the message itself cannot tell us.
    /// Tenants are organizations.
    fn tenant_id_from_queue(&self, queue_id: &str) -> Option<String> {
        self.org_id_from_queue(queue_id)
    }
}

/// Key producer that namespaces every key under a single prefix.
#[derive(Debug, Clone)]
pub struct DefaultKeyProducer {
    prefix: String,
}

impl DefaultKeyProducer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for DefaultKeyProducer {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyProducer for DefaultKeyProducer {
    fn queue_key(&self, queue_id: &str) -> String {
        format!("{}:{}", self.prefix, queue_id)
    }

    fn queue_items_key(&self, queue_id: &str) -> String {
        format!("{}:{}:items", self.prefix, queue_id)
    }

    fn master_queue_key(&self, shard: u32) -> String {
        format!("{}:master:{}", self.prefix, shard)
    }

    fn inflight_key(&self, shard: u32) -> String {
        format!("{}:inflight:{}", self.prefix, shard)
    }

    fn inflight_data_key(&self, shard: u32) -> String {
        format!("{}:inflight:{}:data", self.prefix, shard)
    }

    fn dead_letter_key(&self, tenant_id: &str) -> String {
        format!("{}:dlq:{}", self.prefix, tenant_id)
    }

    fn dead_letter_data_key(&self, tenant_id: &str) -> String {
        format!("{}:dlq:{}:data", self.prefix, tenant_id)
    }

    fn concurrency_key(&self, group: &str, group_key: &str) -> String {
        format!("{}:concurrency:{}:{}", self.prefix, group, group_key)
    }

    fn concurrency_limit_key(&self, group: &str, group_key: &str) -> String {
        format!("{}:concurrency:{}:{}:limit", self.prefix, group, group_key)
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }
}

/// Borrowed view of the parts of a queue id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIdParts<'a> {
    pub org_id: &'a str,
    pub env_id: &'a str,
    pub queue_name: &'a str,
}

/// Splits `org:{org}:env:{env}:queue:{name}` into its parts.
///
/// Org and env ids may not contain `:`; the queue name may.
pub fn parse_queue_id(queue_id: &str) -> Option<QueueIdParts<'_>> {
    let rest = queue_id.strip_prefix("org:")?;
    let (org_id, rest) = rest.split_once(':')?;
    let rest = rest.strip_prefix("env:")?;
    let (env_id, rest) = rest.split_once(':')?;
    let queue_name = rest.strip_prefix("queue:")?;

    if org_id.is_empty() || env_id.is_empty() || queue_name.is_empty() {
        return None;
    }

    Some(QueueIdParts {
        org_id,
        env_id,
        queue_name,
    })
}

/// Shard that owns a queue's master index entry and in-flight records.
pub fn shard_for_queue(queue_id: &str, shard_count: u32) -> u32 {
    if shard_count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(queue_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % shard_count
}

/// Member stored in the in-flight set for a claimed message.
pub fn inflight_member(message_id: &str, queue_id: &str) -> String {
    format!("{message_id}:{queue_id}")
}

/// Splits an in-flight member back into `(message_id, queue_id)`.
///
/// Message ids never contain `:`, so the first separator is the boundary.
pub fn parse_inflight_member(member: &str) -> Option<(&str, &str)> {
    let (message_id, queue_id) = member.split_once(':')?;
    if message_id.is_empty() || queue_id.is_empty() {
        return None;
    }
    Some((message_id, queue_id))
}
