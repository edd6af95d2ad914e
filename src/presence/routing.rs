use crate::store::{PresenceRecord, SharedStore, StoreError};
use std::sync::Arc;

/// Fleet-wide routing table view for one server.
///
/// Publishing and clearing touch `route:{u}` and `status:{u}` in one store operation.
/// Clearing is conditional on this server still owning the route, so a user who
/// reconnected elsewhere keeps the newer record.
#[derive(Clone)]
pub struct PresenceTable {
    store: Arc<dyn SharedStore>,
    server: String,
}

impl PresenceTable {
    pub fn new(store: Arc<dyn SharedStore>, server: impl Into<String>) -> Self {
        Self {
            store,
            server: server.into(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn publish(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.publish_presence(user_id, &self.server).await
    }

    /// Returns `true` when this server's record was removed.
    pub async fn clear(&self, user_id: &str) -> Result<bool, StoreError> {
        self.store.clear_presence(user_id, &self.server).await
    }

    pub async fn lookup(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        self.store.presence(user_id).await
    }

    /// Route for a user: `Local` when this server holds it, `Remote` with the owner's
    /// address, `Offline` otherwise.
    pub async fn route(&self, user_id: &str) -> Result<Route, StoreError> {
        Ok(match self.lookup(user_id).await? {
            Some(record) if record.is_online() && record.server == self.server => Route::Local,
            Some(record) if record.is_online() => Route::Remote(record.server),
            _ => Route::Offline,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(String),
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn reconnect_elsewhere_survives_old_teardown() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let s1 = PresenceTable::new(store.clone(), "10.0.0.1:10001");
        let s2 = PresenceTable::new(store.clone(), "10.0.0.2:10001");

        s1.publish("bob").await.unwrap();
        assert_eq!(s1.route("bob").await.unwrap(), Route::Local);
        s2.publish("bob").await.unwrap();
        assert!(!s1.clear("bob").await.unwrap());
        assert_eq!(
            s1.route("bob").await.unwrap(),
            Route::Remote("10.0.0.2:10001".into())
        );
        assert!(s2.clear("bob").await.unwrap());
        assert_eq!(s1.route("bob").await.unwrap(), Route::Offline);
    }
}
