//! Shared key-value store used by every server in the fleet.
//!
//! - `memory` - In-process implementation with TTL semantics and failure injection
//! - `redis` - Networked implementation; every multi-key operation is one Lua script
//!
//! Every method on [`SharedStore`] is a single atomic store-side operation. Callers never
//! compose read-then-write sequences across keys; the store evaluates the whole update at
//! once, the way a scripted transaction would on a networked key-value server.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key layout shared by all servers.
pub mod keys {
    pub const RETRY_SCHEDULE: &str = "retry:schedule";
    pub const GLOBAL_CONNECTIONS: &str = "limit:global:count";

    pub fn route(user_id: &str) -> String {
        format!("route:{user_id}")
    }

    pub fn status(user_id: &str) -> String {
        format!("status:{user_id}")
    }

    pub fn retry_index(msg_id: &str) -> String {
        format!("retryIndex:{msg_id}")
    }

    pub fn group_shard(group_id: &str) -> String {
        format!("group:server:{group_id}")
    }

    pub fn ip_connections(ip: &str) -> String {
        format!("limit:conn:{ip}")
    }

    pub fn ip_rate(ip: &str) -> String {
        format!("limit:rate:{ip}")
    }

    pub fn ip_blocked(ip: &str) -> String {
        format!("limit:blocked:{ip}")
    }

    pub fn flow_messages(ip: &str) -> String {
        format!("flow:msg:{ip}")
    }

    pub fn flow_bytes(ip: &str) -> String {
        format!("flow:byte:{ip}")
    }

    pub fn flow_throttled(ip: &str) -> String {
        format!("flow:throttled:{ip}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "ONLINE",
            PresenceStatus::Offline => "OFFLINE",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "ONLINE" {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}

/// Routing entry for one user: which server holds the connection and whether it is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub server: String,
    pub status: PresenceStatus,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

/// A schedule member handed to one scanner. `record` is `None` when the lookup index
/// entry was already gone; such members are removed from the schedule by the claim.
#[derive(Debug, Clone)]
pub struct ClaimedRetry {
    pub msg_id: String,
    pub record: Option<Vec<u8>>,
}

/// Connection ceilings evaluated by [`SharedStore::admit_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_total: i64,
    pub max_per_ip: i64,
    pub max_per_window: i64,
    /// Expiry of the per-IP live counter, refreshed on every admission.
    pub ip_ttl: Duration,
    /// Length of the fixed connect-rate window.
    pub rate_window: Duration,
}

/// Outcome of an admission attempt. Counts are the values that caused a refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admitted,
    Blocked,
    GlobalLimit(i64),
    PerIpLimit(i64),
    RateLimit(i64),
}

/// One element of a pipelined shard update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardUpdate {
    pub group_id: String,
    pub server: String,
    pub user_id: String,
}

pub trait SharedStore: Send + Sync {
    /// Set `route:{u}` and `status:{u}` together.
    fn publish_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, ()>;

    /// Delete both presence keys only while `route:{u}` still names `server`.
    fn clear_presence<'a>(&'a self, user_id: &'a str, server: &'a str) -> StoreFuture<'a, bool>;

    fn presence<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<PresenceRecord>>;

    /// Insert or overwrite the schedule member and its index entry.
    fn retry_schedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, ()>;

    /// Like `retry_schedule`, but only when the index entry still exists.
    fn retry_reschedule<'a>(
        &'a self,
        msg_id: &'a str,
        due_ms: u64,
        record: Vec<u8>,
    ) -> StoreFuture<'a, bool>;

    /// The index entry for `msg_id`, without touching the schedule.
    fn retry_record<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    /// Remove schedule member and index entry. `false` when both were already absent.
    fn retry_cancel<'a>(&'a self, msg_id: &'a str) -> StoreFuture<'a, bool>;

    /// Claim up to `limit` due members (score <= `now_ms`, ascending) by pushing their
    /// score to `now_ms + lease_ms`.
    fn retry_claim_due(
        &self,
        now_ms: u64,
        limit: usize,
        lease_ms: u64,
    ) -> StoreFuture<'_, Vec<ClaimedRetry>>;

    fn retry_pending(&self) -> StoreFuture<'_, usize>;

    fn counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    /// Add `by` and return the new value. A `ttl` is re-armed on every increment; `None`
    /// leaves the key without expiry.
    fn incr_counter<'a>(
        &'a self,
        key: &'a str,
        by: i64,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, i64>;

    /// Add `by` to a fixed window counter. The expiry is set when the window opens and is
    /// not extended by later increments.
    fn incr_window<'a>(&'a self, key: &'a str, by: i64, window: Duration)
        -> StoreFuture<'a, i64>;

    /// Subtract one, flooring at zero; a key that reaches zero is deleted.
    fn decr_counter<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    /// Check the block marker and the global, per-IP and rate counters for `ip`, and count
    /// the connection when all pass. Nothing is incremented on a refusal.
    fn admit_connection<'a>(
        &'a self,
        ip: &'a str,
        limits: AdmissionLimits,
    ) -> StoreFuture<'a, AdmissionVerdict>;

    fn set_marker<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()>;

    fn marker<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Add each user to its group's shard entry for the server and refresh the entry TTL.
    /// The batch is one round trip; each element is applied atomically.
    fn shard_add<'a>(&'a self, updates: &'a [ShardUpdate], ttl: Duration) -> StoreFuture<'a, ()>;

    fn shard_remove<'a>(&'a self, updates: &'a [ShardUpdate]) -> StoreFuture<'a, ()>;

    fn shard_members<'a>(
        &'a self,
        group_id: &'a str,
        server: &'a str,
    ) -> StoreFuture<'a, Vec<String>>;

    fn shard_servers<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<String>>;
}
