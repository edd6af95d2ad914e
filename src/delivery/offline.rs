//! Durable offline storage collaborator.
//!
//! Messages land here when a recipient is unreachable or a retry is exhausted, and
//! notices (friend requests/responses, withdrawals) when the target is offline. Both are
//! replayed when the user reconnects and removed only after the replay attempt.

use crate::net::wire::{C2cMsgPush, MsgType};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Boxed future returned by external collaborators.
pub type CollabFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Offline message with durable enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OfflineMessage {
    pub msg_id: u64,
    pub client_msg_id: String,
    pub from: String,
    pub to: String,
    pub chat_id: String,
    pub format: i32,
    pub content: String,
    pub msg_time: u64,
    pub stored_ms: u64,
    pub retry_count: u32,
}

impl OfflineMessage {
    pub fn to_push(&self) -> C2cMsgPush {
        C2cMsgPush {
            msg_id: self.msg_id,
            client_msg_id: self.client_msg_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            format: self.format,
            content: self.content.clone(),
            time: self.msg_time,
            chat_id: self.chat_id.clone(),
            retry_count: self.retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NoticeKind {
    FriendRequest,
    FriendResponse,
    Withdraw,
}

impl NoticeKind {
    /// Replay order on reconnect.
    pub const ALL: [NoticeKind; 3] = [
        NoticeKind::FriendRequest,
        NoticeKind::FriendResponse,
        NoticeKind::Withdraw,
    ];

    pub fn msg_type(&self) -> MsgType {
        match self {
            NoticeKind::FriendRequest => MsgType::FriendRequest,
            NoticeKind::FriendResponse => MsgType::FriendResponse,
            NoticeKind::Withdraw => MsgType::MsgWithdrawNotification,
        }
    }
}

/// Encoded notification waiting for an offline user.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredNotice {
    pub notice_id: u64,
    pub kind: NoticeKind,
    pub payload: Vec<u8>,
}

pub trait OfflineStore: Send + Sync {
    fn save_message(&self, message: OfflineMessage) -> CollabFuture<'_, ()>;

    fn pending_messages<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, Vec<OfflineMessage>>;

    fn remove_messages<'a>(&'a self, user_id: &'a str, msg_ids: &'a [u64])
        -> CollabFuture<'a, usize>;

    fn save_notice<'a>(
        &'a self,
        user_id: &'a str,
        kind: NoticeKind,
        payload: Vec<u8>,
    ) -> CollabFuture<'a, ()>;

    fn pending_notices<'a>(
        &'a self,
        user_id: &'a str,
        kind: NoticeKind,
    ) -> CollabFuture<'a, Vec<StoredNotice>>;

    fn remove_notices<'a>(
        &'a self,
        user_id: &'a str,
        notice_ids: &'a [u64],
    ) -> CollabFuture<'a, usize>;
}

/// Per-user offline queue with byte accounting.
#[derive(Debug, Default, Clone)]
struct OfflineQueue {
    messages: VecDeque<OfflineMessage>,
    notices: VecDeque<StoredNotice>,
    total_bytes: u64,
}

impl OfflineQueue {
    fn enqueue(&mut self, message: OfflineMessage) {
        if self.messages.iter().any(|m| m.msg_id == message.msg_id) {
            return;
        }
        self.total_bytes = self
            .total_bytes
            .saturating_add(message.content.len() as u64);
        self.messages.push_back(message);
    }

    fn remove(&mut self, msg_ids: &[u64]) -> usize {
        let before = self.messages.len();
        let mut freed = 0u64;
        self.messages.retain(|m| {
            let keep = !msg_ids.contains(&m.msg_id);
            if !keep {
                freed += m.content.len() as u64;
            }
            keep
        });
        self.total_bytes = self.total_bytes.saturating_sub(freed);
        before - self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.notices.is_empty()
    }
}

/// In-process offline store used for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryOfflineStore {
    queues: Mutex<HashMap<String, OfflineQueue>>,
    next_notice: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make message saves fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn message_count(&self, user_id: &str) -> usize {
        self.queues
            .lock()
            .get(user_id)
            .map_or(0, |q| q.messages.len())
    }

    pub fn notice_count(&self, user_id: &str) -> usize {
        self.queues
            .lock()
            .get(user_id)
            .map_or(0, |q| q.notices.len())
    }

    pub fn bytes(&self, user_id: &str) -> u64 {
        self.queues.lock().get(user_id).map_or(0, |q| q.total_bytes)
    }

    pub fn messages(&self, user_id: &str) -> Vec<OfflineMessage> {
        self.queues
            .lock()
            .get(user_id)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl OfflineStore for MemoryOfflineStore {
    fn save_message(&self, message: OfflineMessage) -> CollabFuture<'_, ()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Box::pin(std::future::ready(Err(anyhow::anyhow!(
                "offline store unavailable"
            ))));
        }
        let mut queues = self.queues.lock();
        queues.entry(message.to.clone()).or_default().enqueue(message);
        Box::pin(std::future::ready(Ok(())))
    }

    fn pending_messages<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, Vec<OfflineMessage>> {
        Box::pin(std::future::ready(Ok(self.messages(user_id))))
    }

    fn remove_messages<'a>(
        &'a self,
        user_id: &'a str,
        msg_ids: &'a [u64],
    ) -> CollabFuture<'a, usize> {
        let mut queues = self.queues.lock();
        let removed = match queues.get_mut(user_id) {
            Some(queue) => {
                let removed = queue.remove(msg_ids);
                if queue.is_empty() {
                    queues.remove(user_id);
                }
                removed
            }
            None => 0,
        };
        Box::pin(std::future::ready(Ok(removed)))
    }

    fn save_notice<'a>(
        &'a self,
        user_id: &'a str,
        kind: NoticeKind,
        payload: Vec<u8>,
    ) -> CollabFuture<'a, ()> {
        let notice_id = self.next_notice.fetch_add(1, Ordering::Relaxed) + 1;
        self.queues
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .notices
            .push_back(StoredNotice {
                notice_id,
                kind,
                payload,
            });
        Box::pin(std::future::ready(Ok(())))
    }

    fn pending_notices<'a>(
        &'a self,
        user_id: &'a str,
        kind: NoticeKind,
    ) -> CollabFuture<'a, Vec<StoredNotice>> {
        let notices = self
            .queues
            .lock()
            .get(user_id)
            .map(|q| q.notices.iter().filter(|n| n.kind == kind).cloned().collect())
            .unwrap_or_default();
        Box::pin(std::future::ready(Ok(notices)))
    }

    fn remove_notices<'a>(
        &'a self,
        user_id: &'a str,
        notice_ids: &'a [u64],
    ) -> CollabFuture<'a, usize> {
        let mut queues = self.queues.lock();
        let removed = match queues.get_mut(user_id) {
            Some(queue) => {
                let before = queue.notices.len();
                queue.notices.retain(|n| !notice_ids.contains(&n.notice_id));
                let removed = before - queue.notices.len();
                if queue.is_empty() {
                    queues.remove(user_id);
                }
                removed
            }
            None => 0,
        };
        Box::pin(std::future::ready(Ok(removed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_id: u64, to: &str) -> OfflineMessage {
        OfflineMessage {
            msg_id,
            client_msg_id: format!("c-{msg_id}"),
            from: "alice".into(),
            to: to.into(),
            chat_id: "alice:bob".into(),
            format: 1,
            content: "hello".into(),
            msg_time: 1,
            stored_ms: 2,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_message() {
        let store = MemoryOfflineStore::new();
        store.save_message(message(7, "bob")).await.unwrap();
        store.save_message(message(7, "bob")).await.unwrap();
        assert_eq!(store.message_count("bob"), 1);
        assert_eq!(store.bytes("bob"), 5);
    }

    #[tokio::test]
    async fn test_remove_only_replayed_messages() {
        let store = MemoryOfflineStore::new();
        store.save_message(message(1, "bob")).await.unwrap();
        store.save_message(message(2, "bob")).await.unwrap();
        let pending = store.pending_messages("bob").await.unwrap();
        assert_eq!(pending.len(), 2);
        store.save_message(message(3, "bob")).await.unwrap();
        let ids: Vec<u64> = pending.iter().map(|m| m.msg_id).collect();
        assert_eq!(store.remove_messages("bob", &ids).await.unwrap(), 2);
        assert_eq!(store.messages("bob")[0].msg_id, 3);
    }

    #[tokio::test]
    async fn test_notices_filtered_by_kind() {
        let store = MemoryOfflineStore::new();
        store
            .save_notice("bob", NoticeKind::FriendRequest, vec![1])
            .await
            .unwrap();
        store
            .save_notice("bob", NoticeKind::FriendResponse, vec![2])
            .await
            .unwrap();
        let requests = store
            .pending_notices("bob", NoticeKind::FriendRequest)
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].payload, vec![1]);
        let ids = [requests[0].notice_id];
        store.remove_notices("bob", &ids).await.unwrap();
        assert_eq!(store.notice_count("bob"), 1);
    }
}
