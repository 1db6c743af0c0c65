//! Redis-backed queue broker
//!
//! Layout per queue (all under the shared key prefix):
//! - `ready`    ZSET, score = -priority, member = `{seq:020}:{id}`;
//!   ZPOPMIN yields highest priority first and, within a priority,
//!   oldest first via the lexicographic tie-break on seq.
//! - `delayed`  ZSET, score = due millis, member = `{seq:020}:{priority}:{id}`
//! - `inflight` HASH, field = id, value = `{token}:{deadline_millis}:{priority}`
//! - `place`    HASH, field = id, value = `r:<member>` / `d:<member>` / `f`
//! - `paused`   flag key, `seq` counter key
//!
//! Every multi-key transition runs as one Lua script so a crash can
//! never leave a job in two sets. Lease deadlines are data, not Redis
//! TTLs: after a restart the sweep re-reads them and conservatively
//! reaps whatever has lapsed.

use crate::broker::{Broker, BrokerSizes, Placement, Reservation};
use crate::error::{Error, Result};
use crate::job::JobId;
use crate::redis::{KeyPrefix, RedisPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use std::time::Duration;
use uuid::Uuid;

/// Delayed entries promoted per script invocation
const PROMOTE_BATCH: usize = 100;

const ENQUEUE_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
  local tag = string.sub(existing, 1, 1)
  if tag == 'r' then return 'ready'
  elseif tag == 'd' then return 'delayed'
  else return 'in_flight' end
end
local seq = redis.call('INCR', KEYS[4])
local seqstr = string.format('%020d', seq)
if ARGV[3] ~= '' and tonumber(ARGV[3]) > tonumber(ARGV[4]) then
  local member = seqstr .. ':' .. ARGV[2] .. ':' .. ARGV[1]
  redis.call('ZADD', KEYS[3], ARGV[3], member)
  redis.call('HSET', KEYS[1], ARGV[1], 'd:' .. member)
  return 'delayed'
else
  local member = seqstr .. ':' .. ARGV[1]
  redis.call('ZADD', KEYS[2], -tonumber(ARGV[2]), member)
  redis.call('HSET', KEYS[1], ARGV[1], 'r:' .. member)
  return 'ready'
end
"#;

const RESERVE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) then return false end
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then return false end
local member = popped[1]
local priority = -tonumber(popped[2])
local id = string.sub(member, 22)
redis.call('HSET', KEYS[3], id, ARGV[1] .. ':' .. ARGV[2] .. ':' .. priority)
redis.call('HSET', KEYS[4], id, 'f')
return id
"#;

const ACK_SCRIPT: &str = r#"
local val = redis.call('HGET', KEYS[1], ARGV[1])
if not val then return 0 end
local token = string.match(val, '^([^:]+)')
if token ~= ARGV[2] then return 0 end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
"#;

const NACK_SCRIPT: &str = r#"
local val = redis.call('HGET', KEYS[1], ARGV[1])
if not val then return 0 end
local token, deadline, priority = string.match(val, '^([^:]+):([^:]+):(.+)$')
if token ~= ARGV[2] then return 0 end
redis.call('HDEL', KEYS[1], ARGV[1])
if ARGV[3] ~= '' then
  local seq = redis.call('INCR', KEYS[4])
  local member = string.format('%020d', seq) .. ':' .. priority .. ':' .. ARGV[1]
  redis.call('ZADD', KEYS[3], ARGV[3], member)
  redis.call('HSET', KEYS[2], ARGV[1], 'd:' .. member)
else
  redis.call('HDEL', KEYS[2], ARGV[1])
end
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local count = 0
for _, member in ipairs(due) do
  local seqstr, priority, id = string.match(member, '^(%d+):([%-]?%d+):(.+)$')
  redis.call('ZREM', KEYS[1], member)
  local ready_member = seqstr .. ':' .. id
  redis.call('ZADD', KEYS[2], -tonumber(priority), ready_member)
  redis.call('HSET', KEYS[3], id, 'r:' .. ready_member)
  count = count + 1
end
return count
"#;

const REAP_SCRIPT: &str = r#"
local entries = redis.call('HGETALL', KEYS[1])
local expired = {}
for i = 1, #entries, 2 do
  local id = entries[i]
  local deadline = string.match(entries[i + 1], '^[^:]+:([^:]+)')
  if tonumber(deadline) <= tonumber(ARGV[1]) then
    redis.call('HDEL', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    table.insert(expired, id)
  end
end
return expired
"#;

const REMOVE_SCRIPT: &str = r#"
local val = redis.call('HGET', KEYS[1], ARGV[1])
if not val then return 0 end
local tag = string.sub(val, 1, 1)
if tag == 'r' then
  redis.call('ZREM', KEYS[2], string.sub(val, 3))
elseif tag == 'd' then
  redis.call('ZREM', KEYS[3], string.sub(val, 3))
else
  redis.call('HDEL', KEYS[4], ARGV[1])
end
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

/// Broker persisting every queue set in Redis
pub struct RedisBroker {
    pool: RedisPool,
    prefix: KeyPrefix,
    enqueue_script: Script,
    reserve_script: Script,
    ack_script: Script,
    nack_script: Script,
    promote_script: Script,
    reap_script: Script,
    remove_script: Script,
}

impl RedisBroker {
    pub fn new(pool: RedisPool, prefix: KeyPrefix) -> Self {
        Self {
            pool,
            prefix,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            reap_script: Script::new(REAP_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        }
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        self.prefix.queue_key(queue, suffix)
    }

    fn unavailable(err: redis::RedisError) -> Error {
        Error::BrokerUnavailable(err.to_string())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: JobId,
        priority: i32,
        delay_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Placement> {
        let mut conn = self.pool.manager();
        let due = delay_until
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();
        let placement: String = self
            .enqueue_script
            .key(self.key(queue, "place"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "seq"))
            .arg(job_id.to_string())
            .arg(priority)
            .arg(due)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        match placement.as_str() {
            "delayed" => Ok(Placement::Delayed),
            "in_flight" => Ok(Placement::InFlight),
            _ => Ok(Placement::Ready),
        }
    }

    async fn reserve(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>> {
        let mut conn = self.pool.manager();
        let token = Uuid::new_v4();
        let lease_expires_at = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        let popped: Option<String> = self
            .reserve_script
            .key(self.key(queue, "paused"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "place"))
            .arg(token.to_string())
            .arg(lease_expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        match popped {
            Some(id) => {
                let job_id = id
                    .parse::<JobId>()
                    .map_err(|e| Error::BrokerUnavailable(format!("corrupt member id: {}", e)))?;
                Ok(Some(Reservation {
                    job_id,
                    token,
                    lease_expires_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, queue: &str, job_id: JobId, token: Uuid) -> Result<()> {
        let mut conn = self.pool.manager();
        let released: i64 = self
            .ack_script
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "place"))
            .arg(job_id.to_string())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        if released == 1 {
            Ok(())
        } else {
            Err(Error::BadToken)
        }
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: JobId,
        token: Uuid,
        requeue_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.manager();
        let due = requeue_after
            .map(|d| (now + chrono::Duration::milliseconds(d.as_millis() as i64)).timestamp_millis().to_string())
            .unwrap_or_default();
        let released: i64 = self
            .nack_script
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "place"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "seq"))
            .arg(job_id.to_string())
            .arg(token.to_string())
            .arg(due)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        if released == 1 {
            Ok(())
        } else {
            Err(Error::BadToken)
        }
    }

    async fn remove(&self, queue: &str, job_id: JobId) -> Result<bool> {
        let mut conn = self.pool.manager();
        let removed: i64 = self
            .remove_script
            .key(self.key(queue, "place"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "inflight"))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(removed == 1)
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.pool.manager();
        let mut promoted = 0usize;
        loop {
            let batch: usize = self
                .promote_script
                .key(self.key(queue, "delayed"))
                .key(self.key(queue, "ready"))
                .key(self.key(queue, "place"))
                .arg(now.timestamp_millis())
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;
            promoted += batch;
            if batch < PROMOTE_BATCH {
                break;
            }
        }
        Ok(promoted)
    }

    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut conn = self.pool.manager();
        let expired: Vec<String> = self
            .reap_script
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "place"))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(expired
            .into_iter()
            .filter_map(|id| id.parse::<JobId>().ok())
            .collect())
    }

    async fn sizes(&self, queue: &str) -> Result<BrokerSizes> {
        let mut conn = self.pool.manager();
        let (waiting, active, delayed): (usize, usize, usize) = ::redis::pipe()
            .cmd("ZCARD")
            .arg(self.key(queue, "ready"))
            .cmd("HLEN")
            .arg(self.key(queue, "inflight"))
            .cmd("ZCARD")
            .arg(self.key(queue, "delayed"))
            .query_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(BrokerSizes {
            waiting,
            active,
            delayed,
        })
    }

    async fn peek(&self, queue: &str, placement: Placement, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.pool.manager();
        let ids: Vec<String> = match placement {
            Placement::Ready => {
                let members: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.key(queue, "ready"))
                    .arg(0)
                    .arg(limit as isize - 1)
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::unavailable)?;
                // member = "{seq:020}:{id}"
                members
                    .into_iter()
                    .filter_map(|m| m.get(21..).map(str::to_string))
                    .collect()
            }
            Placement::Delayed => {
                let members: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.key(queue, "delayed"))
                    .arg(0)
                    .arg(limit as isize - 1)
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::unavailable)?;
                // member = "{seq:020}:{priority}:{id}"
                members
                    .into_iter()
                    .filter_map(|m| m.splitn(3, ':').nth(2).map(str::to_string))
                    .collect()
            }
            Placement::InFlight => {
                let fields: Vec<String> = redis::cmd("HKEYS")
                    .arg(self.key(queue, "inflight"))
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::unavailable)?;
                fields.into_iter().take(limit).collect()
            }
        };
        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn placement(&self, queue: &str, job_id: JobId) -> Result<Option<Placement>> {
        let mut conn = self.pool.manager();
        let tagged: Option<String> = redis::cmd("HGET")
            .arg(self.key(queue, "place"))
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(tagged.map(|value| match value.as_bytes().first() {
            Some(b'd') => Placement::Delayed,
            Some(b'f') => Placement::InFlight,
            _ => Placement::Ready,
        }))
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        let mut conn = self.pool.manager();
        if paused {
            let _: () = redis::cmd("SET")
                .arg(self.key(queue, "paused"))
                .arg("1")
                .query_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;
        } else {
            let _: () = redis::cmd("DEL")
                .arg(self.key(queue, "paused"))
                .query_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        let mut conn = self.pool.manager();
        let paused: bool = redis::cmd("EXISTS")
            .arg(self.key(queue, "paused"))
            .query_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(paused)
    }
}
