//! Message history collaborator. The delivery core writes every message through and reads
//! a record back only to authorize a withdrawal.

use super::offline::CollabFuture;
use crate::net::wire::AckStatus;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Conversation {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HistoryRecord {
    pub msg_id: u64,
    pub client_msg_id: String,
    pub from: String,
    /// Recipient user for direct messages, group id for group messages.
    pub target: String,
    pub chat_id: String,
    pub conversation: Conversation,
    pub format: i32,
    pub content: String,
    pub msg_time: u64,
    /// Server clock when the message was accepted.
    pub received_ms: u64,
}

pub trait HistoryStore: Send + Sync {
    fn record(&self, record: HistoryRecord) -> CollabFuture<'_, ()>;

    fn update_status(&self, msg_id: u64, status: AckStatus) -> CollabFuture<'_, ()>;

    fn mark_withdrawn<'a>(&'a self, msg_id: u64, by: &'a str, at_ms: u64)
        -> CollabFuture<'a, ()>;

    /// The stored record for `msg_id`, if history kept one.
    fn lookup(&self, msg_id: u64) -> CollabFuture<'_, Option<HistoryRecord>>;
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub record: Option<HistoryRecord>,
    pub status: Option<AckStatus>,
    pub withdrawn_at: Option<u64>,
}

/// In-process history sink; keeps the last write per message for inspection.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<HashMap<u64, HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, msg_id: u64) -> Option<HistoryEntry> {
        self.entries.lock().get(&msg_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entry(&self, msg_id: u64, f: impl FnOnce(&mut HistoryEntry)) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(msg_id).or_insert(HistoryEntry {
            record: None,
            status: None,
            withdrawn_at: None,
        });
        f(entry);
    }
}

impl HistoryStore for MemoryHistory {
    fn record(&self, record: HistoryRecord) -> CollabFuture<'_, ()> {
        self.with_entry(record.msg_id, |entry| entry.record = Some(record));
        Box::pin(std::future::ready(Ok(())))
    }

    fn update_status(&self, msg_id: u64, status: AckStatus) -> CollabFuture<'_, ()> {
        self.with_entry(msg_id, |entry| {
            // status only moves forward: delivered then read
            if entry.status.map_or(true, |current| status > current) {
                entry.status = Some(status);
            }
        });
        Box::pin(std::future::ready(Ok(())))
    }

    fn mark_withdrawn<'a>(
        &'a self,
        msg_id: u64,
        _by: &'a str,
        at_ms: u64,
    ) -> CollabFuture<'a, ()> {
        self.with_entry(msg_id, |entry| entry.withdrawn_at = Some(at_ms));
        Box::pin(std::future::ready(Ok(())))
    }

    fn lookup(&self, msg_id: u64) -> CollabFuture<'_, Option<HistoryRecord>> {
        let record = self
            .entries
            .lock()
            .get(&msg_id)
            .and_then(|entry| entry.record.clone());
        Box::pin(std::future::ready(Ok(record)))
    }
}
