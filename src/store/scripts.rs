//! Lua bodies for the atomic store operations.
//!
//! Conventions shared by every script:
//! - `KEYS[1]` is the waiting sorted set, `KEYS[2]` the registered set and
//!   `KEYS[3]` the claimed hash.
//! - Every key shares the `{prefix}` hash tag, so a script only ever touches
//!   one cluster slot. Per-agent lease keys are passed as `KEYS` wherever the
//!   caller knows the agents up front.
//! - Batch scripts answer `{count, members}`.

/// KEYS[3..] = lease key of each pair, in order; ARGV = `[agent, score]`
/// pairs. Registers keys and inserts those neither pending nor leased.
/// Pairs with a non-numeric score or a numeric agent name are skipped.
pub const ADD_AGENTS: &str = r#"
local added = {}
local count = 0
for j = 1, math.floor(#ARGV / 2) do
  local agent = ARGV[2 * j - 1]
  local score = ARGV[2 * j]
  if tonumber(score) ~= nil and tonumber(agent) == nil then
    redis.call('sadd', KEYS[2], agent)
    local pending = redis.call('zscore', KEYS[1], agent)
    local leased = redis.call('exists', KEYS[2 + j])
    if not pending and leased == 0 then
      redis.call('zadd', KEYS[1], score, agent)
      table.insert(added, agent)
      count = count + 1
    end
  end
end
return {count, added}
"#;

/// KEYS[1]=waiting, KEYS[2]=claimed; ARGV[1]=now, ARGV[2]=limit.
///
/// Removes due members, stamps each in the claimed hash and answers a flat
/// `[agent, score, agent, score, ...]` list.
pub const CLAIM_DUE: &str = r#"
local due = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, tonumber(ARGV[2]))
local claimed = {}
for i = 1, #due, 2 do
  if redis.call('zrem', KEYS[1], due[i]) == 1 then
    redis.call('hset', KEYS[2], due[i], ARGV[1])
    table.insert(claimed, due[i])
    table.insert(claimed, due[i + 1])
  end
end
return claimed
"#;

/// ARGV[1]=agent, ARGV[2]=score.
pub const RELEASE: &str = r#"
redis.call('sadd', KEYS[2], ARGV[1])
redis.call('zadd', KEYS[1], ARGV[2], ARGV[1])
redis.call('hdel', KEYS[3], ARGV[1])
return 1
"#;

/// KEYS[4]=lease key; ARGV[1]=agent, ARGV[2]=owner, ARGV[3]=score.
pub const RESCHEDULE_OWNED: &str = r#"
local owner = redis.call('get', KEYS[4])
if owner and owner ~= ARGV[2] then
  return 'not_owner'
end
redis.call('hdel', KEYS[3], ARGV[1])
if redis.call('sismember', KEYS[2], ARGV[1]) == 0 then
  if owner then
    redis.call('del', KEYS[4])
  end
  return 'deregistered'
end
redis.call('zadd', KEYS[1], ARGV[3], ARGV[1])
if owner then
  redis.call('del', KEYS[4])
  return 'rescheduled'
end
return 'requeued'
"#;

/// KEYS[4..] = lease key of each agent, in order; ARGV[1]=mode (`any` or
/// `not_leased`), then the agents.
pub const REMOVE_AGENTS_CONDITIONAL: &str = r#"
local removed = {}
local count = 0
local mode = ARGV[1]
for i = 2, #ARGV do
  local agent = ARGV[i]
  local match = mode == 'any'
  if mode == 'not_leased' then
    match = redis.call('exists', KEYS[2 + i]) == 0
  end
  if match then
    local zr = redis.call('zrem', KEYS[1], agent)
    local sr = redis.call('srem', KEYS[2], agent)
    redis.call('hdel', KEYS[3], agent)
    if zr == 1 or sr == 1 then
      table.insert(removed, agent)
      count = count + 1
    end
  end
end
return {count, removed}
"#;

/// ARGV[1]=lease key prefix, ARGV[2]=score, ARGV[3]=claimed before,
/// ARGV[4]=limit.
///
/// Candidates come from the registered set, so their lease keys are built
/// here. The prefix carries the same hash tag as `KEYS`, keeping them in
/// one slot.
pub const RESTORE_ORPHANS: &str = r#"
local members = redis.call('smembers', KEYS[2])
local restored = {}
local count = 0
local cutoff = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
for _, agent in ipairs(members) do
  if count >= limit then
    break
  end
  local pending = redis.call('zscore', KEYS[1], agent)
  local claimed = tonumber(redis.call('hget', KEYS[3], agent))
  local settled = claimed == nil or claimed <= cutoff
  if not pending and settled and redis.call('exists', ARGV[1] .. agent) == 0 then
    redis.call('zadd', KEYS[1], ARGV[2], agent)
    redis.call('hdel', KEYS[3], agent)
    table.insert(restored, agent)
    count = count + 1
  end
end
return {count, restored}
"#;

/// KEYS[1]=lease key; ARGV[1]=owner, ARGV[2]=ttl ms.
pub const CLAIM_LEASE: &str = r#"
local current = redis.call('get', KEYS[1])
if not current then
  redis.call('set', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
elseif current == ARGV[1] then
  redis.call('pexpire', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS[1]=lease key; ARGV[1]=owner, ARGV[2]=ttl ms.
pub const RENEW_LEASE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('pexpire', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS[1]=lease key; ARGV[1]=owner.
pub const RELEASE_LEASE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
end
return 0
"#;
