//! Redis implementation of [`SharedStore`].
//!
//! Single-key reads go out as plain commands. Every operation touching more than one key,
//! or reading before writing, runs as one Lua script so a fleet of servers sees it as a
//! single step. Scripts address keys derived inside the script (the retry index), which
//! ties this layout to a standalone or sentinel deployment rather than Redis Cluster.

use super::{
    keys, AdmissionLimits, AdmissionVerdict, ClaimedRetry, PresenceRecord, PresenceStatus,
    ShardUpdate, SharedStore, StoreError, StoreFuture,
};
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError, Script, ScriptInvocation};
use std::time::Duration;

const CLEAR_PRESENCE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1], KEYS[2])
  return 1
end
return 0
";

const RETRY_SCHEDULE: &str = r"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
return 1
";

const RETRY_RESCHEDULE: &str = r"
if redis.call('EXISTS', KEYS[2]) == 0 then
  redis.call('ZREM', KEYS[1], ARGV[2])
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
return 1
";

const RETRY_CANCEL: &str = r"
return redis.call('ZREM', KEYS[1], ARGV[1]) + redis.call('DEL', KEYS[2])
";

const RETRY_CLAIM: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local claimed = {}
for _, id in ipairs(due) do
  local record = redis.call('GET', ARGV[4] .. id)
  if record then
    redis.call('ZADD', KEYS[1], ARGV[3], id)
    table.insert(claimed, {id, 1, record})
  else
    redis.call('ZREM', KEYS[1], id)
    table.insert(claimed, {id, 0, ''})
  end
end
return claimed
";

const INCR_COUNTER: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
";

const INCR_WINDOW: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
";

const DECR_COUNTER: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECR', KEYS[1])
";

const ADMIT_CONNECTION: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {1, 0}
end
local global = tonumber(redis.call('GET', KEYS[2]) or '0')
if global >= tonumber(ARGV[1]) then
  return {2, global}
end
local per_ip = tonumber(redis.call('GET', KEYS[3]) or '0')
if per_ip >= tonumber(ARGV[2]) then
  return {3, per_ip}
end
local rate = tonumber(redis.call('GET', KEYS[4]) or '0')
if rate >= tonumber(ARGV[3]) then
  return {4, rate}
end
redis.call('INCR', KEYS[2])
redis.call('INCR', KEYS[3])
redis.call('PEXPIRE', KEYS[3], ARGV[4])
if redis.call('INCR', KEYS[4]) == 1 then
  redis.call('PEXPIRE', KEYS[4], ARGV[5])
end
return {0, 0}
";

const SHARD_ADD: &str = r"
for i, key in ipairs(KEYS) do
  local server = ARGV[2 * i]
  local user = ARGV[2 * i + 1]
  local raw = redis.call('HGET', key, server)
  local members = {}
  if raw then
    members = cjson.decode(raw)
  end
  local present = false
  for _, member in ipairs(members) do
    if member == user then
      present = true
      break
    end
  end
  if not present then
    table.insert(members, user)
    redis.call('HSET', key, server, cjson.encode(members))
  end
  redis.call('PEXPIRE', key, ARGV[1])
end
return #KEYS
";

const SHARD_REMOVE: &str = r"
for i, key in ipairs(KEYS) do
  local server = ARGV[2 * i - 1]
  local user = ARGV[2 * i]
  local raw = redis.call('HGET', key, server)
  if raw then
    local kept = {}
    for _, member in ipairs(cjson.decode(raw)) do
      if member ~= user then
        table.insert(kept, member)
      end
    end
    if #kept == 0 then
      redis.call('HDEL', key, server)
    else
      redis.call('HSET', key, server, cjson.encode(kept))
    end
  end
end
return #KEYS
";

struct Scripts {
    clear_presence: Script,
    retry_schedule: Script,
    retry_reschedule: Script,
    retry_cancel: Script,
    retry_claim: Script,
    incr_counter: Script,
    incr_window: Script,
    decr_counter: Script,
    admit_connection: Script,
    shard_add: Script,
    shard_remove: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            clear_presence: Script::new(CLEAR_PRESENCE),
            retry_schedule: Script::new(RETRY_SCHEDULE),
            retry_reschedule: Script::new(RETRY_RESCHEDULE),
            retry_cancel: Script::new(RETRY_CANCEL),
            retry_claim: Script::new(RETRY_CLAIM),
            incr_counter: Script::new(INCR_COUNTER),
            incr_window: Script::new(INCR_WINDOW),
            decr_counter: Script::new(DECR_COUNTER),
            admit_connection: Script::new(ADMIT_CONNECTION),
            shard_add: Script::new(SHARD_ADD),
            shard_remove: Script::new(SHARD_REMOVE),
        }
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn verdict_from_reply(code: i64, count: i64) -> Result<AdmissionVerdict, StoreError> {
    match code {
        0 => Ok(AdmissionVerdict::Admitted),
        1 => Ok(AdmissionVerdict::Blocked),
        2 => Ok(AdmissionVerdict::GlobalLimit(count)),
        3 => Ok(AdmissionVerdict::PerIpLimit(count)),
        4 => Ok(AdmissionVerdict::RateLimit(count)),
        other => Err(StoreError::Corrupt {
            key: "admission".to_string(),
            reason: format!("unknown verdict code {other}"),
        }),
    }
}

fn parse_members(key: &str, raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

/// [`SharedStore`] over one multiplexed Redis connection, cloned per call.
pub struct RedisStore {
    conn: MultiplexedConnection,
    scripts: Scripts,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        tracing::info!("shared store connected to redis");
        Ok(Self {
            conn,
            scripts: Scripts::load(),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(unavailable)
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        invocation.invoke_async(&mut conn).await.map_err(unavailable)
    }
}

impl SharedStore for RedisStore {
    fn publish_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut cmd = redis::cmd("MSET");
            cmd.arg(keys::route(user_id))
                .arg(server)
                .arg(keys::status(user_id))
                .arg(PresenceStatus::Online.as_str());
            self.query(&cmd).await
        })
    }

    fn clear_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut invocation = self.scripts.clear_presence.prepare_invoke();
            invocation
                .key(keys::route(user_id))
                .key(keys::status(user_id))
                .arg(server);
            let cleared: i64 = self.invoke(&invocation).await?;
            Ok(cleared == 1)
        })
    }

    fn presence<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<PresenceRecord>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("MGET");
            cmd.arg(keys::route(user_id)).arg(keys::status(user_id));
            let (server, status): (Option<String>, Option<String>) = self.query(&cmd).await?;
            Ok(server.map(|server| PresenceRecord {
                server,
                status: status.map_or(PresenceStatus::Offline, |s| PresenceStatus::parse(&s)),
            }))
        })
    }

    fn retry_schedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut invocation = self.scripts.retry_schedule.prepare_invoke();
            invocation
                .key(keys::RETRY_SCHEDULE)
                .key(keys::retry_index(msg_id))
                .arg(due_ms)
                .arg(msg_id)
                .arg(record);
            let _: i64 = self.invoke(&invocation).await?;
            Ok(())
        })
    }

    fn retry_reschedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut invocation = self.scripts.retry_reschedule.prepare_invoke();
            invocation
                .key(keys::RETRY_SCHEDULE)
                .key(keys::retry_index(msg_id))
                .arg(due_ms)
                .arg(msg_id)
                .arg(record);
            let kept: i64 = self.invoke(&invocation).await?;
            Ok(kept == 1)
        })
    }

    fn retry_record<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("GET");
            cmd.arg(keys::retry_index(msg_id));
            self.query(&cmd).await
        })
    }

    fn retry_cancel<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut invocation = self.scripts.retry_cancel.prepare_invoke();
            invocation
                .key(keys::RETRY_SCHEDULE)
                .key(keys::retry_index(msg_id))
                .arg(msg_id);
            let removed: i64 = self.invoke(&invocation).await?;
            Ok(removed > 0)
        })
    }

    fn retry_claim_due(
        &self,
        now_ms: u64,
        limit: usize,
        lease_ms: u64,
    ) -> StoreFuture<'_, Vec<ClaimedRetry>> {
        Box::pin(async move {
            let mut invocation = self.scripts.retry_claim.prepare_invoke();
            invocation
                .key(keys::RETRY_SCHEDULE)
                .arg(now_ms)
                .arg(limit)
                .arg(now_ms + lease_ms)
                .arg(keys::retry_index(""));
            let rows: Vec<(String, i64, Vec<u8>)> = self.invoke(&invocation).await?;
            Ok(rows
                .into_iter()
                .map(|(msg_id, found, record)| ClaimedRetry {
                    msg_id,
                    record: (found == 1).then_some(record),
                })
                .collect())
        })
    }

    fn retry_pending(&self) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut cmd = redis::cmd("ZCARD");
            cmd.arg(keys::RETRY_SCHEDULE);
            self.query(&cmd).await
        })
    }

    fn counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            let value: Option<i64> = self.query(&cmd).await?;
            Ok(value.unwrap_or(0))
        })
    }

    fn incr_counter<'a>(
        &'a self,
        key: &'a str,
        by: i64,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut invocation = self.scripts.incr_counter.prepare_invoke();
            invocation
                .key(key)
                .arg(by)
                .arg(ttl.map_or(0, millis));
            self.invoke(&invocation).await
        })
    }

    fn incr_window<'a>(
        &'a self,
        key: &'a str,
        by: i64,
        window: Duration,
    ) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut invocation = self.scripts.incr_window.prepare_invoke();
            invocation.key(key).arg(by).arg(millis(window));
            self.invoke(&invocation).await
        })
    }

    fn decr_counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut invocation = self.scripts.decr_counter.prepare_invoke();
            invocation.key(key);
            self.invoke(&invocation).await
        })
    }

    fn admit_connection<'a>(
        &'a self,
        ip: &'a str,
        limits: AdmissionLimits,
    ) -> StoreFuture<'a, AdmissionVerdict> {
        Box::pin(async move {
            let mut invocation = self.scripts.admit_connection.prepare_invoke();
            invocation
                .key(keys::ip_blocked(ip))
                .key(keys::GLOBAL_CONNECTIONS)
                .key(keys::ip_connections(ip))
                .key(keys::ip_rate(ip))
                .arg(limits.max_total)
                .arg(limits.max_per_ip)
                .arg(limits.max_per_window)
                .arg(millis(limits.ip_ttl))
                .arg(millis(limits.rate_window));
            let (code, count): (i64, i64) = self.invoke(&invocation).await?;
            verdict_from_reply(code, count)
        })
    }

    fn set_marker<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            self.query(&cmd).await
        })
    }

    fn marker<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            self.query(&cmd).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            let removed: i64 = self.query(&cmd).await?;
            Ok(removed > 0)
        })
    }

    fn shard_add<'a>(&'a self, updates: &'a [ShardUpdate], ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if updates.is_empty() {
                return Ok(());
            }
            let mut invocation = self.scripts.shard_add.prepare_invoke();
            invocation.arg(millis(ttl));
            for update in updates {
                invocation
                    .key(keys::group_shard(&update.group_id))
                    .arg(&update.server)
                    .arg(&update.user_id);
            }
            let _: i64 = self.invoke(&invocation).await?;
            Ok(())
        })
    }

    fn shard_remove<'a>(&'a self, updates: &'a [ShardUpdate]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if updates.is_empty() {
                return Ok(());
            }
            let mut invocation = self.scripts.shard_remove.prepare_invoke();
            for update in updates {
                invocation
                    .key(keys::group_shard(&update.group_id))
                    .arg(&update.server)
                    .arg(&update.user_id);
            }
            let _: i64 = self.invoke(&invocation).await?;
            Ok(())
        })
    }

    fn shard_members<'a>(
        &'a self,
        group_id: &'a str,
        server: &'a str,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let key = keys::group_shard(group_id);
            let mut cmd = redis::cmd("HGET");
            cmd.arg(&key).arg(server);
            let raw: Option<String> = self.query(&cmd).await?;
            match raw {
                Some(raw) => parse_members(&key, &raw),
                None => Ok(Vec::new()),
            }
        })
    }

    fn shard_servers<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("HKEYS");
            cmd.arg(keys::group_shard(group_id));
            let mut servers: Vec<String> = self.query(&cmd).await?;
            servers.sort();
            Ok(servers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_codes() {
        assert_eq!(verdict_from_reply(0, 0).unwrap(), AdmissionVerdict::Admitted);
        assert_eq!(verdict_from_reply(1, 0).unwrap(), AdmissionVerdict::Blocked);
        assert_eq!(
            verdict_from_reply(3, 5).unwrap(),
            AdmissionVerdict::PerIpLimit(5)
        );
        assert!(matches!(
            verdict_from_reply(9, 0),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_shard_members_decode() {
        assert_eq!(
            parse_members("group:server:g1", r#"["u1","u2"]"#).unwrap(),
            vec!["u1", "u2"]
        );
        let err = parse_members("group:server:g1", "{}").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { key, .. } if key == "group:server:g1"));
    }
}
