use super::{
    keys, AdmissionLimits, AdmissionVerdict, ClaimedRetry, PresenceRecord, PresenceStatus,
    ShardUpdate, SharedStore, StoreError, StoreFuture,
};
use crate::time::{Clock, SystemClock};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Expiring<T> {
    fn new(value: T, now_ms: u64, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now_ms + ttl.as_millis() as u64),
        }
    }

    fn live(&self, now_ms: u64) -> bool {
        self.expires_at.map_or(true, |at| now_ms < at)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Expiring<String>>,
    counters: HashMap<String, Expiring<i64>>,
    schedule: BTreeSet<(u64, String)>,
    scores: HashMap<String, u64>,
    index: HashMap<String, Vec<u8>>,
    shards: HashMap<String, Expiring<HashMap<String, Vec<String>>>>,
}

impl Inner {
    fn string(&mut self, key: &str, now_ms: u64) -> Option<String> {
        match self.strings.get(key) {
            Some(entry) if entry.live(now_ms) => Some(entry.value.clone()),
            Some(_) => {
                self.strings.remove(key);
                None
            }
            None => None,
        }
    }

    fn counter(&mut self, key: &str, now_ms: u64) -> Option<&mut Expiring<i64>> {
        if self.counters.get(key).is_some_and(|e| !e.live(now_ms)) {
            self.counters.remove(key);
        }
        self.counters.get_mut(key)
    }

    fn count(&mut self, key: &str, now_ms: u64) -> i64 {
        self.counter(key, now_ms).map_or(0, |e| e.value)
    }

    /// With `refresh` a given `ttl` is re-armed on every call; otherwise it is set only on
    /// creation.
    fn incr(
        &mut self,
        key: &str,
        by: i64,
        now_ms: u64,
        ttl: Option<Duration>,
        refresh: bool,
    ) -> i64 {
        if let Some(entry) = self.counter(key, now_ms) {
            entry.value += by;
            if let (true, Some(ttl)) = (refresh, ttl) {
                entry.expires_at = Some(now_ms + ttl.as_millis() as u64);
            }
            return entry.value;
        }
        self.counters
            .insert(key.to_string(), Expiring::new(by, now_ms, ttl));
        by
    }

    fn expire_shard(&mut self, key: &str, now_ms: u64) {
        if self.shards.get(key).is_some_and(|e| !e.live(now_ms)) {
            self.shards.remove(key);
        }
    }

    fn shard(&mut self, key: &str, now_ms: u64) -> Option<&mut Expiring<HashMap<String, Vec<String>>>> {
        self.expire_shard(key, now_ms);
        self.shards.get_mut(key)
    }

    fn unschedule(&mut self, msg_id: &str) -> bool {
        match self.scores.remove(msg_id) {
            Some(score) => self.schedule.remove(&(score, msg_id.to_string())),
            None => false,
        }
    }

    fn schedule(&mut self, msg_id: &str, due_ms: u64) {
        self.unschedule(msg_id);
        self.schedule.insert((due_ms, msg_id.to_string()));
        self.scores.insert(msg_id.to_string(), due_ms);
    }
}

/// In-process [`SharedStore`]. One instance shared by several runtimes behaves like a
/// single networked store serving a fleet.
pub struct MemoryStore<C: Clock = SystemClock> {
    inner: Mutex<Inner>,
    clock: C,
    unavailable: AtomicBool,
    operations: AtomicU64,
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            unavailable: AtomicBool::new(false),
            operations: AtomicU64::new(0),
        }
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of round trips served; a pipelined batch counts once.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Whether the index holds `msg_id`; paired with `is_scheduled` to check atomicity.
    pub fn is_indexed(&self, msg_id: &str) -> bool {
        self.inner.lock().index.contains_key(msg_id)
    }

    pub fn is_scheduled(&self, msg_id: &str) -> bool {
        self.inner.lock().scores.contains_key(msg_id)
    }

    pub fn scheduled_at(&self, msg_id: &str) -> Option<u64> {
        self.inner.lock().scores.get(msg_id).copied()
    }

    fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Inner, u64) -> Result<T, StoreError>,
    {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        let now_ms = self.clock.now_millis();
        let mut guard = self.inner.lock();
        op(&mut guard, now_ms)
    }

    fn ready<'a, T: Send + 'a>(result: Result<T, StoreError>) -> StoreFuture<'a, T> {
        Box::pin(std::future::ready(result))
    }
}

impl<C: Clock> SharedStore for MemoryStore<C> {
    fn publish_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, ()> {
        Self::ready(self.run(|inner, now| {
            inner.strings.insert(
                keys::route(user_id),
                Expiring::new(server.to_string(), now, None),
            );
            inner.strings.insert(
                keys::status(user_id),
                Expiring::new(PresenceStatus::Online.as_str().to_string(), now, None),
            );
            Ok(())
        }))
    }

    fn clear_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, bool> {
        Self::ready(self.run(|inner, now| {
            let route_key = keys::route(user_id);
            if inner.string(&route_key, now).as_deref() != Some(server) {
                return Ok(false);
            }
            inner.strings.remove(&route_key);
            inner.strings.remove(&keys::status(user_id));
            Ok(true)
        }))
    }

    fn presence<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<PresenceRecord>> {
        Self::ready(self.run(|inner, now| {
            let Some(server) = inner.string(&keys::route(user_id), now) else {
                return Ok(None);
            };
            let status = inner
                .string(&keys::status(user_id), now)
                .map(|s| PresenceStatus::parse(&s))
                .unwrap_or(PresenceStatus::Offline);
            Ok(Some(PresenceRecord { server, status }))
        }))
    }

    fn retry_schedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, ()> {
        Self::ready(self.run(move |inner, _| {
            inner.schedule(msg_id, due_ms);
            inner.index.insert(msg_id.to_string(), record);
            Ok(())
        }))
    }

    fn retry_reschedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, bool> {
        Self::ready(self.run(move |inner, _| {
            if !inner.index.contains_key(msg_id) {
                inner.unschedule(msg_id);
                return Ok(false);
            }
            inner.schedule(msg_id, due_ms);
            inner.index.insert(msg_id.to_string(), record);
            Ok(true)
        }))
    }

    fn retry_record<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Self::ready(self.run(|inner, _| Ok(inner.index.get(msg_id).cloned())))
    }

    fn retry_cancel<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, bool> {
        Self::ready(self.run(|inner, _| {
            let scheduled = inner.unschedule(msg_id);
            let indexed = inner.index.remove(msg_id).is_some();
            Ok(scheduled || indexed)
        }))
    }

    fn retry_claim_due(
        &self,
        now_ms: u64,
        limit: usize,
        lease_ms: u64,
    ) -> StoreFuture<'_, Vec<ClaimedRetry>> {
        Self::ready(self.run(|inner, _| {
            let due: Vec<String> = inner
                .schedule
                .iter()
                .take_while(|(score, _)| *score <= now_ms)
                .take(limit)
                .map(|(_, id)| id.clone())
                .collect();
            let mut claimed = Vec::with_capacity(due.len());
            for msg_id in due {
                match inner.index.get(&msg_id).cloned() {
                    Some(record) => {
                        inner.schedule(&msg_id, now_ms + lease_ms);
                        claimed.push(ClaimedRetry {
                            msg_id,
                            record: Some(record),
                        });
                    }
                    None => {
                        inner.unschedule(&msg_id);
                        claimed.push(ClaimedRetry {
                            msg_id,
                            record: None,
                        });
                    }
                }
            }
            Ok(claimed)
        }))
    }

    fn retry_pending(&self) -> StoreFuture<'_, usize> {
        Self::ready(self.run(|inner, _| Ok(inner.schedule.len())))
    }

    fn counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Self::ready(self.run(|inner, now| Ok(inner.counter(key, now).map_or(0, |e| e.value))))
    }

    fn incr_counter<'a>(
        &'a self,
        key: &'a str,
        by: i64,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, i64> {
        Self::ready(self.run(|inner, now| Ok(inner.incr(key, by, now, ttl, true))))
    }

    fn incr_window<'a>(
        &'a self,
        key: &'a str,
        by: i64,
        window: Duration,
    ) -> StoreFuture<'a, i64> {
        Self::ready(self.run(|inner, now| Ok(inner.incr(key, by, now, Some(window), false))))
    }

    fn decr_counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Self::ready(self.run(|inner, now| {
            let Some(entry) = inner.counter(key, now) else {
                return Ok(0);
            };
            entry.value -= 1;
            if entry.value <= 0 {
                inner.counters.remove(key);
                return Ok(0);
            }
            Ok(entry.value)
        }))
    }

    fn admit_connection<'a>(
        &'a self,
        ip: &'a str,
        limits: AdmissionLimits,
    ) -> StoreFuture<'a, AdmissionVerdict> {
        Self::ready(self.run(|inner, now| {
            if inner.string(&keys::ip_blocked(ip), now).is_some() {
                return Ok(AdmissionVerdict::Blocked);
            }
            let global = inner.count(keys::GLOBAL_CONNECTIONS, now);
            if global >= limits.max_total {
                return Ok(AdmissionVerdict::GlobalLimit(global));
            }
            let ip_key = keys::ip_connections(ip);
            let per_ip = inner.count(&ip_key, now);
            if per_ip >= limits.max_per_ip {
                return Ok(AdmissionVerdict::PerIpLimit(per_ip));
            }
            let rate_key = keys::ip_rate(ip);
            let rate = inner.count(&rate_key, now);
            if rate >= limits.max_per_window {
                return Ok(AdmissionVerdict::RateLimit(rate));
            }
            inner.incr(keys::GLOBAL_CONNECTIONS, 1, now, None, true);
            inner.incr(&ip_key, 1, now, Some(limits.ip_ttl), true);
            inner.incr(&rate_key, 1, now, Some(limits.rate_window), false);
            Ok(AdmissionVerdict::Admitted)
        }))
    }

    fn set_marker<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Self::ready(self.run(|inner, now| {
            inner
                .strings
                .insert(key.to_string(), Expiring::new(value.to_string(), now, ttl));
            Ok(())
        }))
    }

    fn marker<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Self::ready(self.run(|inner, now| Ok(inner.string(key, now))))
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Self::ready(self.run(|inner, _| {
            let removed = inner.strings.remove(key).is_some()
                | inner.counters.remove(key).is_some()
                | inner.shards.remove(key).is_some();
            Ok(removed)
        }))
    }

    fn shard_add<'a>(&'a self, updates: &'a [ShardUpdate], ttl: Duration) -> StoreFuture<'a, ()> {
        Self::ready(self.run(|inner, now| {
            for update in updates {
                let key = keys::group_shard(&update.group_id);
                inner.expire_shard(&key, now);
                let entry = inner
                    .shards
                    .entry(key)
                    .or_insert_with(|| Expiring::new(HashMap::new(), now, Some(ttl)));
                let members = entry.value.entry(update.server.clone()).or_default();
                if !members.contains(&update.user_id) {
                    members.push(update.user_id.clone());
                }
                entry.expires_at = Some(now + ttl.as_millis() as u64);
            }
            Ok(())
        }))
    }

    fn shard_remove<'a>(&'a self, updates: &'a [ShardUpdate]) -> StoreFuture<'a, ()> {
        Self::ready(self.run(|inner, now| {
            for update in updates {
                let key = keys::group_shard(&update.group_id);
                let Some(entry) = inner.shard(&key, now) else {
                    continue;
                };
                if let Some(members) = entry.value.get_mut(&update.server) {
                    members.retain(|m| m != &update.user_id);
                    if members.is_empty() {
                        entry.value.remove(&update.server);
                    }
                }
                if entry.value.is_empty() {
                    inner.shards.remove(&key);
                }
            }
            Ok(())
        }))
    }

    fn shard_members<'a>(
        &'a self,
        group_id: &'a str,
        server: &'a str,
    ) -> StoreFuture<'a, Vec<String>> {
        Self::ready(self.run(|inner, now| {
            let key = keys::group_shard(group_id);
            Ok(inner
                .shard(&key, now)
                .and_then(|e| e.value.get(server).cloned())
                .unwrap_or_default())
        }))
    }

    fn shard_servers<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<String>> {
        Self::ready(self.run(|inner, now| {
            let key = keys::group_shard(group_id);
            let mut servers: Vec<String> = inner
                .shard(&key, now)
                .map(|e| e.value.keys().cloned().collect())
                .unwrap_or_default();
            servers.sort();
            Ok(servers)
        }))
    }
}
