use super::membership::MembershipCache;
use crate::ops::metrics::DeliveryMetrics;
use crate::store::{SharedStore, ShardUpdate, StoreError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    /// Shard entries touched for this many groups.
    Updated(usize),
    /// Membership cache miss; a rebuild was requested and the update skipped.
    Rebuilding,
    /// Store or cache failure; logged and abandoned.
    Failed,
}

/// Maintains this server's slice of every group: the members it currently hosts.
///
/// Entries carry a TTL refreshed on each connect, so a crashed server's slices age out.
#[derive(Clone)]
pub struct GroupShardService {
    store: Arc<dyn SharedStore>,
    membership: Arc<dyn MembershipCache>,
    server: String,
    ttl: Duration,
    metrics: DeliveryMetrics,
}

impl GroupShardService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        membership: Arc<dyn MembershipCache>,
        server: impl Into<String>,
        ttl: Duration,
        metrics: DeliveryMetrics,
    ) -> Self {
        Self {
            store,
            membership,
            server: server.into(),
            ttl,
            metrics,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn updates_for(&self, user_id: &str) -> Result<Option<Vec<ShardUpdate>>, ShardOutcome> {
        let groups = match self.membership.groups_of(user_id).await {
            Ok(groups) => groups,
            Err(err) => {
                tracing::warn!("membership lookup failed for {user_id}: {err:#}");
                return Err(ShardOutcome::Failed);
            }
        };
        Ok(groups.map(|groups| {
            groups
                .into_iter()
                .map(|group_id| ShardUpdate {
                    group_id,
                    server: self.server.clone(),
                    user_id: user_id.to_string(),
                })
                .collect()
        }))
    }

    /// Add `user_id` to each of its groups' entries for this server in one batch.
    pub async fn on_connect(&self, user_id: &str) -> ShardOutcome {
        let updates = match self.updates_for(user_id).await {
            Ok(Some(updates)) => updates,
            Ok(None) => {
                if let Err(err) = self.membership.request_rebuild(user_id).await {
                    tracing::warn!("membership rebuild request failed for {user_id}: {err:#}");
                }
                tracing::debug!("membership miss for {user_id}, shard update skipped");
                return ShardOutcome::Rebuilding;
            }
            Err(outcome) => return outcome,
        };
        if updates.is_empty() {
            return ShardOutcome::Updated(0);
        }
        match self.store.shard_add(&updates, self.ttl).await {
            Ok(()) => {
                self.metrics.shard_updated(updates.len());
                ShardOutcome::Updated(updates.len())
            }
            Err(err) => {
                tracing::warn!("shard add failed for {user_id}: {err}");
                ShardOutcome::Failed
            }
        }
    }

    /// Remove `user_id` from its groups' entries for this server. A cache miss leaves the
    /// entries to expire.
    pub async fn on_disconnect(&self, user_id: &str) -> ShardOutcome {
        let updates = match self.updates_for(user_id).await {
            Ok(Some(updates)) => updates,
            Ok(None) => return ShardOutcome::Rebuilding,
            Err(outcome) => return outcome,
        };
        if updates.is_empty() {
            return ShardOutcome::Updated(0);
        }
        match self.store.shard_remove(&updates).await {
            Ok(()) => {
                self.metrics.shard_updated(updates.len());
                ShardOutcome::Updated(updates.len())
            }
            Err(err) => {
                tracing::warn!("shard remove failed for {user_id}: {err}");
                ShardOutcome::Failed
            }
        }
    }

    /// Members of `group_id` hosted by this server. One point lookup.
    pub async fn local_members_of(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.shard_members(group_id, &self.server).await
    }

    /// Servers currently hosting at least one member of `group_id`.
    pub async fn servers_of(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.shard_servers(group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::MemoryMembership;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;

    fn service(
        store: &Arc<MemoryStore<ManualClock>>,
        membership: &Arc<MemoryMembership>,
        server: &str,
    ) -> GroupShardService {
        GroupShardService::new(
            store.clone(),
            membership.clone(),
            server,
            Duration::from_secs(3_600),
            DeliveryMetrics::default(),
        )
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_update_local_slice() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock));
        let membership = Arc::new(MemoryMembership::new());
        membership.set_groups("u", ["g1", "g2"]);
        let s1 = service(&store, &membership, "s1");
        let s2 = service(&store, &membership, "s2");

        assert_eq!(s1.on_connect("u").await, ShardOutcome::Updated(2));
        assert_eq!(s1.local_members_of("g1").await.unwrap(), vec!["u".to_string()]);
        assert!(s2.local_members_of("g1").await.unwrap().is_empty());
        assert_eq!(s2.servers_of("g2").await.unwrap(), vec!["s1".to_string()]);

        assert_eq!(s1.on_disconnect("u").await, ShardOutcome::Updated(2));
        assert!(s1.local_members_of("g1").await.unwrap().is_empty());
        assert!(s1.local_members_of("g2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_miss_requests_rebuild() {
        let store = Arc::new(MemoryStore::with_clock(ManualClock::default()));
        let membership = Arc::new(MemoryMembership::new());
        let s1 = service(&store, &membership, "s1");
        assert_eq!(s1.on_connect("ghost").await, ShardOutcome::Rebuilding);
        assert_eq!(membership.rebuild_requests(), vec!["ghost".to_string()]);
        assert_eq!(store.operations(), 0);
    }

    #[tokio::test]
    async fn test_stale_slice_expires() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let membership = Arc::new(MemoryMembership::new());
        membership.set_groups("u", ["g1"]);
        let s1 = service(&store, &membership, "s1");
        s1.on_connect("u").await;
        clock.advance(Duration::from_secs(3_601));
        assert!(s1.local_members_of("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_reported() {
        let store = Arc::new(MemoryStore::with_clock(ManualClock::default()));
        let membership = Arc::new(MemoryMembership::new());
        membership.set_groups("u", ["g1"]);
        let s1 = service(&store, &membership, "s1");
        store.set_unavailable(true);
        assert_eq!(s1.on_connect("u").await, ShardOutcome::Failed);
    }
}
