//! Lua scripts for atomic multi-key transitions.
//!
//! Every transition that touches more than one key (job hash plus the
//! wait/active/delayed/priority structures) runs as a script so concurrent
//! workers observe it atomically. Timestamps are passed in as epoch
//! milliseconds; scripts never read the server clock.

use redis::Script;

/// One compiled script per state transition.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub claim: Script,
    pub renew_lease: Script,
    pub complete: Script,
    pub fail: Script,
    pub cancel: Script,
    pub retry: Script,
    pub update_stages: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            renew_lease: Script::new(RENEW_LEASE),
            complete: Script::new(COMPLETE),
            fail: Script::new(FAIL),
            cancel: Script::new(CANCEL),
            retry: Script::new(RETRY),
            update_stages: Script::new(UPDATE_STAGES),
        }
    }
}

/// KEYS: wait, priority, delayed, dedup, ids, bykey, completed, failed
/// ARGV: job_prefix, queue, id, key, data, metadata, priority,
///       scheduled_for_ms, max_attempts, stages, now_ms, replace
///
/// Returns `{id, code}` with code one of created / duplicate / replaced /
/// active. The caller interprets `active` according to its replace policy.
const ENQUEUE: &str = r#"
local prefix = ARGV[1]
local id = ARGV[3]
local key = ARGV[4]
local prio = tonumber(ARGV[7])
local run_at = tonumber(ARGV[8])
local now = tonumber(ARGV[11])

local function push_ready(jid, p, at)
  if at > now then
    redis.call('ZADD', KEYS[3], at, jid)
  elseif p > 0 then
    redis.call('ZADD', KEYS[2], p, jid)
  else
    redis.call('RPUSH', KEYS[1], jid)
  end
end

if key ~= '' then
  local existing = redis.call('HGET', KEYS[4], key)
  if existing then
    if ARGV[12] == 'never' then
      return {existing, 'duplicate'}
    end
    local jk = prefix .. existing
    local status = redis.call('HGET', jk, 'status')
    if status == 'processing' then
      return {existing, 'active'}
    end
    redis.call('LREM', KEYS[1], 0, existing)
    redis.call('ZREM', KEYS[2], existing)
    redis.call('ZREM', KEYS[3], existing)
    redis.call('ZREM', KEYS[7], existing)
    redis.call('ZREM', KEYS[8], existing)
    redis.call('HSET', jk, 'data', ARGV[5], 'priority', ARGV[7],
      'scheduled_for', ARGV[8], 'attempts', 0, 'max_attempts', ARGV[9],
      'status', 'pending', 'overall_progress', 0, 'stalled_count', 0,
      'updated_at', now)
    if ARGV[6] ~= '' then
      redis.call('HSET', jk, 'metadata', ARGV[6])
    else
      redis.call('HDEL', jk, 'metadata')
    end
    if ARGV[10] ~= '' then
      redis.call('HSET', jk, 'stages', ARGV[10])
    else
      redis.call('HDEL', jk, 'stages')
    end
    redis.call('HDEL', jk, 'locked_by', 'locked_at', 'expires_at', 'last_error')
    push_ready(existing, prio, run_at)
    return {existing, 'replaced'}
  end
end

local jk = prefix .. id
redis.call('HSET', jk, 'id', id, 'queue', ARGV[2], 'data', ARGV[5],
  'priority', ARGV[7], 'scheduled_for', ARGV[8], 'attempts', 0,
  'max_attempts', ARGV[9], 'status', 'pending', 'overall_progress', 0,
  'stalled_count', 0, 'created_at', now, 'updated_at', now)
if key ~= '' then
  redis.call('HSET', jk, 'key', key)
  redis.call('HSET', KEYS[4], key, id)
  redis.call('HSET', KEYS[6], key, id)
end
if ARGV[6] ~= '' then
  redis.call('HSET', jk, 'metadata', ARGV[6])
end
if ARGV[10] ~= '' then
  redis.call('HSET', jk, 'stages', ARGV[10])
end
redis.call('HSET', KEYS[5], id, ARGV[2])
push_ready(id, prio, run_at)
return {id, 'created'}
"#;

/// KEYS: wait, priority, delayed, active, failed
/// ARGV: job_prefix, now_ms, limit, worker_id, lease_ms, max_stalled
///
/// Recovers stalled active jobs, promotes matured delayed jobs, then hands
/// out up to `limit` job ids. The wait list drains before the priority zset
/// because its members all carry priority 0, the highest priority.
const CLAIM: &str = r#"
local prefix = ARGV[1]
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local worker = ARGV[4]
local lease = tonumber(ARGV[5])
local max_stalled = tonumber(ARGV[6])

local function requeue(jid, p)
  if p > 0 then
    redis.call('ZADD', KEYS[2], p, jid)
  else
    redis.call('RPUSH', KEYS[1], jid)
  end
end

local active = redis.call('LRANGE', KEYS[4], 0, -1)
for _, jid in ipairs(active) do
  local jk = prefix .. jid
  local status = redis.call('HGET', jk, 'status')
  if status ~= 'processing' then
    redis.call('LREM', KEYS[4], 0, jid)
  else
    local exp = tonumber(redis.call('HGET', jk, 'expires_at') or '0')
    if exp < now then
      redis.call('LREM', KEYS[4], 0, jid)
      local stalled = tonumber(redis.call('HGET', jk, 'stalled_count') or '0') + 1
      redis.call('HDEL', jk, 'locked_by', 'locked_at', 'expires_at')
      if stalled > max_stalled then
        redis.call('HSET', jk, 'status', 'failed', 'stalled_count', stalled,
          'last_error', 'job stalled more than allowable limit',
          'updated_at', now)
        redis.call('ZADD', KEYS[5], now, jid)
      else
        redis.call('HSET', jk, 'status', 'pending', 'stalled_count', stalled,
          'updated_at', now)
        requeue(jid, tonumber(redis.call('HGET', jk, 'priority') or '0'))
      end
    end
  end
end

local due = redis.call('ZRANGEBYSCORE', KEYS[3], 0, now)
for _, jid in ipairs(due) do
  redis.call('ZREM', KEYS[3], jid)
  requeue(jid, tonumber(redis.call('HGET', prefix .. jid, 'priority') or '0'))
end

local claimed = {}
for i = 1, limit do
  local jid = redis.call('LPOP', KEYS[1])
  if not jid then
    local z = redis.call('ZPOPMIN', KEYS[2])
    if z[1] then jid = z[1] else break end
  end
  local jk = prefix .. jid
  local attempts = tonumber(redis.call('HGET', jk, 'attempts') or '0') + 1
  redis.call('HSET', jk, 'status', 'processing', 'locked_by', worker,
    'locked_at', now, 'expires_at', now + lease, 'attempts', attempts,
    'updated_at', now)
  redis.call('RPUSH', KEYS[4], jid)
  claimed[#claimed + 1] = jid
end
return claimed
"#;

/// KEYS: job hash. ARGV: worker_id, lease_ms, now_ms.
const RENEW_LEASE: &str = r#"
if redis.call('HGET', KEYS[1], 'status') == 'processing'
    and redis.call('HGET', KEYS[1], 'locked_by') == ARGV[1] then
  redis.call('HSET', KEYS[1],
    'expires_at', tonumber(ARGV[3]) + tonumber(ARGV[2]),
    'updated_at', ARGV[3])
  return 1
end
return 0
"#;

/// KEYS: job hash, active, completed. ARGV: id, worker_id, now_ms.
const COMPLETE: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'processing'
    or redis.call('HGET', KEYS[1], 'locked_by') ~= ARGV[2] then
  return 0
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('HDEL', KEYS[1], 'locked_by', 'locked_at', 'expires_at')
redis.call('HSET', KEYS[1], 'status', 'completed', 'overall_progress', 100,
  'updated_at', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS: job hash, active, delayed, failed.
/// ARGV: id, worker_id, error, requeue_at_ms ('' = terminal), now_ms.
const FAIL: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'processing'
    or redis.call('HGET', KEYS[1], 'locked_by') ~= ARGV[2] then
  return 0
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('HDEL', KEYS[1], 'locked_by', 'locked_at', 'expires_at')
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[1], 'status', 'pending', 'scheduled_for', ARGV[4],
    'last_error', ARGV[3], 'updated_at', ARGV[5])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), ARGV[1])
else
  redis.call('HSET', KEYS[1], 'status', 'failed', 'last_error', ARGV[3],
    'updated_at', ARGV[5])
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
end
return 1
"#;

/// KEYS: job hash, wait, priority, delayed, active, failed. ARGV: id, now_ms.
const CANCEL: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'pending' and status ~= 'processing' then
  return 0
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('LREM', KEYS[5], 0, ARGV[1])
redis.call('HDEL', KEYS[1], 'locked_by', 'locked_at', 'expires_at')
redis.call('HSET', KEYS[1], 'status', 'failed', 'last_error', 'cancelled',
  'updated_at', ARGV[2])
redis.call('ZADD', KEYS[6], ARGV[2], ARGV[1])
return 1
"#;

/// KEYS: job hash, wait, priority, failed. ARGV: id, now_ms.
const RETRY: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'failed' then
  return 0
end
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('HSET', KEYS[1], 'status', 'pending', 'attempts', 0,
  'scheduled_for', ARGV[2], 'stalled_count', 0, 'updated_at', ARGV[2])
local prio = tonumber(redis.call('HGET', KEYS[1], 'priority') or '0')
if prio > 0 then
  redis.call('ZADD', KEYS[3], prio, ARGV[1])
else
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// KEYS: job hash. ARGV: worker_id, stages_json ('' = clear), overall, now_ms.
const UPDATE_STAGES: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'processing'
    or redis.call('HGET', KEYS[1], 'locked_by') ~= ARGV[1] then
  return 0
end
if ARGV[2] ~= '' then
  redis.call('HSET', KEYS[1], 'stages', ARGV[2])
else
  redis.call('HDEL', KEYS[1], 'stages')
end
redis.call('HSET', KEYS[1], 'overall_progress', ARGV[3], 'updated_at', ARGV[4])
return 1
"#;
