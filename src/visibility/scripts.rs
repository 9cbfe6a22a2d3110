//! Lua sources for the visibility manager.
//!
//! Every script that moves a message between the queue set, the in-flight
//! set, the items hash and the master index runs as one `EVALSHA`, so no
//! observer can see a message in both places or in neither.

/// Re-points a queue's master index entry at its oldest remaining score,
/// or drops it when the queue is empty. Expects `queueKey`, `masterKey`
/// and `queueId` locals.
macro_rules! refresh_master {
    () => {
        r#"
local head = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
if #head == 0 then
  redis.call('ZREM', masterKey, queueId)
else
  redis.call('ZADD', masterKey, head[2], queueId)
end
"#
    };
}

/// KEYS: queue, items, master. ARGV: queueId, then (id, score, payload) triples.
pub(crate) const ENQUEUE: &str = concat!(
    r#"
local queueKey = KEYS[1]
local itemsKey = KEYS[2]
local masterKey = KEYS[3]
local queueId = ARGV[1]
local count = 0
for i = 2, #ARGV, 3 do
  local id = ARGV[i]
  redis.call('HSET', itemsKey, id, ARGV[i + 2])
  redis.call('ZADD', queueKey, ARGV[i + 1], id)
  count = count + 1
end
"#,
    refresh_master!(),
    r#"
return count
"#
);

/// KEYS: queue, items, master, inflight, inflightData.
/// ARGV: queueId, now, deadline, maxCount.
/// Returns a flat list of (id, payload) pairs. Bodies that are not valid
/// JSON are dropped from the items hash, never enter in-flight, and come
/// back with an empty payload.
pub(crate) const CLAIM: &str = concat!(
    r#"
local queueKey = KEYS[1]
local itemsKey = KEYS[2]
local masterKey = KEYS[3]
local inflightKey = KEYS[4]
local inflightDataKey = KEYS[5]
local queueId = ARGV[1]
local now = ARGV[2]
local deadline = ARGV[3]
local maxCount = tonumber(ARGV[4])

local ready = redis.call('ZRANGEBYSCORE', queueKey, '-inf', now, 'LIMIT', 0, maxCount)
local claimed = {}
for _, id in ipairs(ready) do
  redis.call('ZREM', queueKey, id)
  local data = redis.call('HGET', itemsKey, id)
  if data and not pcall(cjson.decode, data) then
    redis.call('HDEL', itemsKey, id)
    claimed[#claimed + 1] = id
    claimed[#claimed + 1] = ''
  elseif data then
    redis.call('ZADD', inflightKey, deadline, id .. ':' .. queueId)
    redis.call('HSET', inflightDataKey, id, data)
    claimed[#claimed + 1] = id
    claimed[#claimed + 1] = data
  end
end
"#,
    refresh_master!(),
    r#"
return claimed
"#
);

/// KEYS: inflight. ARGV: member, newDeadline.
pub(crate) const HEARTBEAT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], 'XX', ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

/// KEYS: inflight, inflightData, items. ARGV: member, id.
///
/// The items entry is only dropped while the message is still in flight;
/// a message that was already reclaimed keeps its body for redelivery.
pub(crate) const COMPLETE: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[2])
if removed == 1 then
  redis.call('HDEL', KEYS[3], ARGV[2])
end
return removed
"#;

/// KEYS: inflight, inflightData, queue, items, master.
/// ARGV: queueId, then (id, score, payload) triples; an empty payload keeps
/// the stored body.
pub(crate) const RELEASE: &str = concat!(
    r#"
local inflightKey = KEYS[1]
local inflightDataKey = KEYS[2]
local queueKey = KEYS[3]
local itemsKey = KEYS[4]
local masterKey = KEYS[5]
local queueId = ARGV[1]
local released = 0
for i = 2, #ARGV, 3 do
  local id = ARGV[i]
  if redis.call('ZREM', inflightKey, id .. ':' .. queueId) == 1 then
    redis.call('HDEL', inflightDataKey, id)
    if ARGV[i + 2] ~= '' then
      redis.call('HSET', itemsKey, id, ARGV[i + 2])
    end
    redis.call('ZADD', queueKey, ARGV[i + 1], id)
    released = released + 1
  end
end
if released > 0 then
"#,
    refresh_master!(),
    r#"
end
return released
"#
);

/// KEYS: inflight, inflightData. ARGV: now, limit.
/// Returns (member, data) pairs for expired claims; missing data is ''.
pub(crate) const SCAN_EXPIRED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local result = {}
for _, member in ipairs(expired) do
  local sep = string.find(member, ':', 1, true)
  local data = false
  if sep then
    data = redis.call('HGET', KEYS[2], string.sub(member, 1, sep - 1))
  end
  result[#result + 1] = member
  result[#result + 1] = data or ''
end
return result
"#;

/// KEYS: inflight, inflightData, items, dlq, dlqData.
/// ARGV: member, id, now, deadLetterPayload.
pub(crate) const DEAD_LETTER: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[3], ARGV[2])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[2])
redis.call('HSET', KEYS[5], ARGV[2], ARGV[4])
return 1
"#;

/// KEYS: dlq, dlqData, queue, items, master. ARGV: id, queueId, score, payload.
pub(crate) const REDRIVE: &str = concat!(
    r#"
local dlqKey = KEYS[1]
local dlqDataKey = KEYS[2]
local queueKey = KEYS[3]
local itemsKey = KEYS[4]
local masterKey = KEYS[5]
local id = ARGV[1]
local queueId = ARGV[2]
if redis.call('ZREM', dlqKey, id) == 0 then
  return 0
end
redis.call('HDEL', dlqDataKey, id)
redis.call('HSET', itemsKey, id, ARGV[4])
redis.call('ZADD', queueKey, ARGV[3], id)
"#,
    refresh_master!(),
    r#"
return 1
"#
);
