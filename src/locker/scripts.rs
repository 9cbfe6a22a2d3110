//! Lua sources for multi-resource leases.
//!
//! Each script covers every key of one lock, so a node either grants or
//! refuses the whole resource set.

/// KEYS: lock keys. ARGV: token, ttlMs. Returns 1 if every key was free.
pub(crate) const ACQUIRE: &str = r#"
for i = 1, #KEYS do
  if redis.call('EXISTS', KEYS[i]) == 1 then
    return 0
  end
end
for i = 1, #KEYS do
  redis.call('SET', KEYS[i], ARGV[1], 'PX', ARGV[2])
end
return 1
"#;

/// KEYS: lock keys. ARGV: token, ttlMs. Returns 1 if every key was still ours.
pub(crate) const EXTEND: &str = r#"
for i = 1, #KEYS do
  if redis.call('GET', KEYS[i]) ~= ARGV[1] then
    return 0
  end
end
for i = 1, #KEYS do
  redis.call('PEXPIRE', KEYS[i], ARGV[2])
end
return 1
"#;

/// KEYS: lock keys. ARGV: token. Returns the number of keys deleted.
pub(crate) const RELEASE: &str = r#"
local released = 0
for i = 1, #KEYS do
  if redis.call('GET', KEYS[i]) == ARGV[1] then
    redis.call('DEL', KEYS[i])
    released = released + 1
  end
end
return released
"#;
