use crate::net::wire::ImProtoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Work for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    /// Server-initiated heartbeat probe.
    Probe,
    Close(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("outbound buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Handle to one live socket. Cloning is cheap; all clones address the same writer.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    user_id: String,
    peer_ip: String,
    created_ms: u64,
    last_activity_ms: AtomicU64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(
        user_id: impl Into<String>,
        peer_ip: impl Into<String>,
        created_ms: u64,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                user_id: user_id.into(),
                peer_ip: peer_ip.into(),
                created_ms,
                last_activity_ms: AtomicU64::new(created_ms),
                tx,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn peer_ip(&self) -> &str {
        &self.inner.peer_ip
    }

    pub fn created_ms(&self) -> u64 {
        self.inner.created_ms
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now_ms: u64) {
        self.inner.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Queue an encoded response for the writer. Never waits.
    pub fn push(&self, response: &ImProtoResponse) -> Result<(), PushError> {
        self.send(Outbound::Frame(Bytes::from(response.encode_to_vec())))
    }

    pub fn probe(&self) -> Result<(), PushError> {
        self.send(Outbound::Probe)
    }

    pub fn close(&self, reason: &str) {
        let _ = self.send(Outbound::Close(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    fn send(&self, item: Outbound) -> Result<(), PushError> {
        self.inner.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("peer_ip", &self.inner.peer_ip)
            .finish()
    }
}

/// Per-process table of live connections, at most one per user.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` for its user, returning the connection it replaced.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections
            .insert(handle.user_id().to_string(), handle)
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(user_id).map(|e| e.value().clone())
    }

    pub fn unregister(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.remove(user_id).map(|(_, handle)| handle)
    }

    /// Remove the user's entry only if it is still `handle`. A replaced connection's
    /// teardown must not evict its successor.
    pub fn release(&self, handle: &ConnectionHandle) -> bool {
        self.connections
            .remove_if(handle.user_id(), |_, current| current.id() == handle.id())
            .is_some()
    }

    pub fn all_online_ids(&self) -> HashSet<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::MsgType;

    fn handle(user: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(user, "10.0.0.1", 1_000, tx), rx)
    }

    #[test]
    fn test_register_replaces_previous_entry() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice");
        let (second, _rx2) = handle("alice");
        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).unwrap();
        assert_eq!(replaced.id(), first.id());
        assert_eq!(registry.lookup("alice").unwrap().id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_ignores_stale_handle() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice");
        let (second, _rx2) = handle("alice");
        registry.register(first.clone());
        registry.register(second.clone());
        assert!(!registry.release(&first));
        assert!(registry.lookup("alice").is_some());
        assert!(registry.release(&second));
        assert!(registry.lookup("alice").is_none());
    }

    #[test]
    fn test_all_online_ids() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle("a");
        let (b, _rb) = handle("b");
        registry.register(a);
        registry.register(b);
        registry.unregister("a");
        let ids = registry.all_online_ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("b"));
    }

    #[test]
    fn test_push_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new("u", "ip", 0, tx);
        let response = ImProtoResponse::success(MsgType::Heartbeat, Vec::new());
        conn.push(&response).unwrap();
        assert_eq!(conn.push(&response), Err(PushError::Full));
        drop(rx);
        assert_eq!(conn.push(&response), Err(PushError::Closed));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let (conn, _rx) = handle("u");
        conn.touch(5_000);
        conn.touch(4_000);
        assert_eq!(conn.last_activity_ms(), 5_000);
    }
}
