//! Reliable direct-message delivery.
//!
//! Every push to an online recipient is followed by an entry in the shared retry schedule.
//! The entry lives until the recipient acknowledges (cancel), or until the scanner gives
//! up and demotes the message to the offline store. States:
//!
//! ```text
//! AWAITING_ACK -> RETRYING (0..max_retries) -> ACKED | DEMOTED_TO_OFFLINE
//! ```
//!
//! The schedule and its lookup index are always written together by one store operation.
//! Cancellation is the deletion of the index entry; a resend first re-inserts the entry
//! conditionally on the index still existing, so an acknowledgement racing a scan always
//! wins over the resend.

use super::offline::{OfflineMessage, OfflineStore};
use super::pool::WorkerPool;
use crate::config::RetryConfig;
use crate::net::wire::{C2cMsgPush, ImProtoResponse, MsgType};
use crate::ops::metrics::DeliveryMetrics;
use crate::presence::{ConnectionRegistry, PresenceTable};
use crate::store::{SharedStore, StoreError};
use crate::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryableDelivery {
    pub msg_id: u64,
    pub client_msg_id: String,
    pub from: String,
    pub to: String,
    pub chat_id: String,
    pub format: i32,
    pub content: String,
    pub msg_time: u64,
    pub created_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl RetryableDelivery {
    pub fn from_push(push: &C2cMsgPush, created_ms: u64, max_retries: u32) -> Self {
        Self {
            msg_id: push.msg_id,
            client_msg_id: push.client_msg_id.clone(),
            from: push.from.clone(),
            to: push.to.clone(),
            chat_id: push.chat_id.clone(),
            format: push.format,
            content: push.content.clone(),
            msg_time: push.time,
            created_ms,
            retry_count: 0,
            max_retries,
        }
    }

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

    pub fn to_offline(&self, stored_ms: u64) -> OfflineMessage {
        OfflineMessage {
            msg_id: self.msg_id,
            client_msg_id: self.client_msg_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            chat_id: self.chat_id.clone(),
            format: self.format,
            content: self.content.clone(),
            msg_time: self.msg_time,
            stored_ms,
            retry_count: self.retry_count,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn encode(&self) -> Result<Vec<u8>, RetryError> {
        serde_json::to_vec(self).map_err(|err| RetryError::Encode(err.to_string()))
    }

    fn decode(msg_id: &str, bytes: &[u8]) -> Result<Self, RetryError> {
        serde_json::from_slice(bytes).map_err(|err| {
            RetryError::Store(StoreError::Corrupt {
                key: crate::store::keys::retry_index(msg_id),
                reason: err.to_string(),
            })
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("retry record encode failed: {0}")]
    Encode(String),
    #[error("offline store rejected message {msg_id}: {reason}")]
    Offline { msg_id: u64, reason: String },
}

/// Scanner tunables resolved from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub ladder: Vec<Duration>,
    pub batch_size: usize,
    pub claim_lease: Duration,
    pub scan_interval: Duration,
}

impl RetrySettings {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ladder: config.ladder(),
            batch_size: config.batch_size,
            claim_lease: Duration::from_secs(config.claim_lease_seconds),
            scan_interval: config.scan_interval(),
        }
    }

    /// Delay before the attempt that follows `retry_count` sends. Clamped to the last step.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let last = self.ladder.len().saturating_sub(1);
        self.ladder
            .get((retry_count as usize).min(last))
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Result of one scanner tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub claimed: usize,
    /// Members whose index entry was gone at claim time.
    pub already_acked: usize,
    pub corrupt: usize,
    pub recipients: usize,
    /// Recipient batches the resend pool refused; their entries come back after the lease.
    pub rejected: usize,
}

/// How an acknowledgement affected the retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Cancelled,
    /// Nothing pending: already acknowledged, demoted, or never tracked.
    NotPending,
    /// The pending delivery is addressed to someone else; it is left in place.
    WrongRecipient { recipient: String },
}

/// What a recipient batch did, for tests and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecipientOutcome {
    pub resent: usize,
    pub demoted: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

struct EngineInner<C: Clock> {
    clock: C,
    store: Arc<dyn SharedStore>,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTable,
    offline: Arc<dyn OfflineStore>,
    pool: WorkerPool,
    metrics: DeliveryMetrics,
    settings: RetrySettings,
}

#[derive(Clone)]
pub struct RetryEngine<C: Clock> {
    inner: Arc<EngineInner<C>>,
}

impl<C: Clock> RetryEngine<C> {
    pub fn new(
        clock: C,
        store: Arc<dyn SharedStore>,
        registry: Arc<ConnectionRegistry>,
        presence: PresenceTable,
        offline: Arc<dyn OfflineStore>,
        pool: WorkerPool,
        metrics: DeliveryMetrics,
        settings: RetrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                clock,
                store,
                registry,
                presence,
                offline,
                pool,
                metrics,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Track a message that was just pushed to an online recipient.
    ///
    /// A failed insert means the message was delivered once and will not be retried; it is
    /// logged and counted, never surfaced to the sender.
    pub async fn enqueue(&self, push: &C2cMsgPush) -> Result<(), RetryError> {
        let inner = &self.inner;
        let now = inner.clock.now_millis();
        let record = RetryableDelivery::from_push(push, now, inner.settings.max_retries);
        let due = now + inner.settings.delay_for(0).as_millis() as u64;
        let msg_id = record.msg_id.to_string();
        let result = match record.encode() {
            Ok(bytes) => inner
                .store
                .retry_schedule(&msg_id, due, bytes)
                .await
                .map_err(RetryError::from),
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => {
                inner.metrics.retry_enqueued();
                tracing::debug!("retry scheduled for {msg_id} to {} at {due}", record.to);
            }
            Err(err) => {
                inner.metrics.retry_enqueue_failed();
                tracing::warn!("retry enqueue failed for {msg_id}: {err}");
            }
        }
        result
    }

    /// Stop retrying `msg_id`. Returns `false` when nothing was pending; late and duplicate
    /// acknowledgements land here and are not errors.
    pub async fn cancel(&self, msg_id: u64) -> Result<bool, RetryError> {
        let removed = self.inner.store.retry_cancel(&msg_id.to_string()).await?;
        if removed {
            self.inner.metrics.retry_acked();
        }
        Ok(removed)
    }

    /// Cancel on behalf of `user_id`, who must be the recipient of the pending delivery.
    pub async fn acknowledge(&self, msg_id: u64, user_id: &str) -> Result<AckOutcome, RetryError> {
        let key = msg_id.to_string();
        let Some(bytes) = self.inner.store.retry_record(&key).await? else {
            return Ok(AckOutcome::NotPending);
        };
        let record = RetryableDelivery::decode(&key, &bytes)?;
        if record.to != user_id {
            return Ok(AckOutcome::WrongRecipient {
                recipient: record.to,
            });
        }
        if self.cancel(msg_id).await? {
            Ok(AckOutcome::Cancelled)
        } else {
            Ok(AckOutcome::NotPending)
        }
    }

    pub async fn pending(&self) -> Result<usize, RetryError> {
        Ok(self.inner.store.retry_pending().await?)
    }

    /// Claim due entries and hand them, grouped by recipient, to the resend pool.
    ///
    /// The claim pushes each entry out by the lease, so entries of a batch the pool
    /// refuses are picked up again by a later tick.
    pub async fn scan_once(&self) -> Result<ScanReport, RetryError> {
        let inner = &self.inner;
        let now = inner.clock.now_millis();
        let lease = inner.settings.claim_lease.as_millis() as u64;
        let claimed = inner
            .store
            .retry_claim_due(now, inner.settings.batch_size, lease)
            .await?;
        let mut report = ScanReport {
            claimed: claimed.len(),
            ..ScanReport::default()
        };

        let mut by_recipient: BTreeMap<String, Vec<RetryableDelivery>> = BTreeMap::new();
        for entry in claimed {
            let Some(bytes) = entry.record else {
                report.already_acked += 1;
                continue;
            };
            match RetryableDelivery::decode(&entry.msg_id, &bytes) {
                Ok(record) => by_recipient.entry(record.to.clone()).or_default().push(record),
                Err(err) => {
                    report.corrupt += 1;
                    tracing::warn!("dropping unreadable retry entry {}: {err}", entry.msg_id);
                    if let Err(err) = inner.store.retry_cancel(&entry.msg_id).await {
                        tracing::warn!("retry cancel failed for {}: {err}", entry.msg_id);
                    }
                }
            }
        }

        report.recipients = by_recipient.len();
        for (user_id, records) in by_recipient {
            let engine = self.clone();
            let job = async move {
                let outcome = engine.process_recipient(&user_id, records).await;
                tracing::debug!("retry batch for {user_id}: {outcome:?}");
            };
            if let Err(err) = inner.pool.try_submit(job) {
                report.rejected += 1;
                tracing::warn!("retry batch dropped: {err}");
            }
        }
        Ok(report)
    }

    /// Resolve the recipient once, then resend or demote each of its due entries.
    pub async fn process_recipient(
        &self,
        user_id: &str,
        records: Vec<RetryableDelivery>,
    ) -> RecipientOutcome {
        let inner = &self.inner;
        let mut outcome = RecipientOutcome::default();
        let connection = inner.registry.lookup(user_id);
        let online_here = match inner.presence.lookup(user_id).await {
            Ok(record) => {
                record.is_some_and(|r| r.is_online() && r.server == inner.presence.server())
            }
            Err(err) => {
                // entries reappear once the claim lease runs out
                tracing::warn!("presence lookup failed for {user_id}, skipping retries: {err}");
                outcome.skipped = records.len();
                return outcome;
            }
        };
        let reachable = match connection {
            Some(handle) if online_here && !handle.is_closed() => Some(handle),
            _ => None,
        };

        for record in records {
            if record.is_exhausted() || reachable.is_none() {
                match self.demote(&record).await {
                    Ok(true) => outcome.demoted += 1,
                    Ok(false) => outcome.cancelled += 1,
                    Err(err) => {
                        outcome.skipped += 1;
                        tracing::warn!("demote failed for {}: {err}", record.msg_id);
                    }
                }
                continue;
            }
            let Some(handle) = reachable.as_ref() else {
                continue;
            };
            match self.resend(handle, record).await {
                Ok(true) => outcome.resent += 1,
                Ok(false) => outcome.cancelled += 1,
                Err(err) => {
                    outcome.skipped += 1;
                    tracing::warn!("resend failed: {err}");
                }
            }
        }
        outcome
    }

    /// Re-insert with the next ladder step, then push. Returns `false` when the entry was
    /// acknowledged in the meantime.
    async fn resend(
        &self,
        handle: &crate::presence::ConnectionHandle,
        mut record: RetryableDelivery,
    ) -> Result<bool, RetryError> {
        let inner = &self.inner;
        record.retry_count += 1;
        let now = inner.clock.now_millis();
        let due = now + inner.settings.delay_for(record.retry_count).as_millis() as u64;
        let msg_id = record.msg_id.to_string();
        let kept = inner
            .store
            .retry_reschedule(&msg_id, due, record.encode()?)
            .await?;
        if !kept {
            return Ok(false);
        }
        let response = ImProtoResponse::with_payload(MsgType::C2cMsgPush, &record.to_push());
        if let Err(err) = handle.push(&response) {
            tracing::debug!("resend of {msg_id} to {} not queued: {err}", record.to);
        }
        inner.metrics.retry_resent();
        tracing::debug!(
            "resent {msg_id} to {} (attempt {}/{})",
            record.to,
            record.retry_count,
            record.max_retries
        );
        Ok(true)
    }

    /// Take the entry off the schedule, then persist it offline. Returns `false` without
    /// saving when an acknowledgement removed the entry first. A failed save puts the
    /// entry back, due after one lease.
    async fn demote(&self, record: &RetryableDelivery) -> Result<bool, RetryError> {
        let inner = &self.inner;
        let msg_id = record.msg_id.to_string();
        if !inner.store.retry_cancel(&msg_id).await? {
            return Ok(false);
        }
        let now = inner.clock.now_millis();
        if let Err(err) = inner.offline.save_message(record.to_offline(now)).await {
            let due = now + inner.settings.claim_lease.as_millis() as u64;
            if let Err(restore) = inner
                .store
                .retry_schedule(&msg_id, due, record.encode()?)
                .await
            {
                tracing::error!("retry entry {msg_id} lost after failed demote: {restore}");
            }
            return Err(RetryError::Offline {
                msg_id: record.msg_id,
                reason: err.to_string(),
            });
        }
        inner.metrics.retry_demoted();
        tracing::info!(
            "demoted {} to offline for {} after {} retries",
            record.msg_id,
            record.to,
            record.retry_count
        );
        Ok(true)
    }

    /// Tick until `shutdown` flips, then let in-flight resend batches finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.settings.scan_interval;
        tracing::info!("retry scanner started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = self.inner.clock.sleep(interval) => {
                    match self.scan_once().await {
                        Ok(report) if report.claimed > 0 => {
                            tracing::debug!("retry scan: {report:?}");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!("retry scan failed: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.inner.pool.stop();
        self.inner.pool.quiesce().await;
        tracing::info!("retry scanner stopped");
    }

    pub async fn quiesce(&self) {
        self.inner.pool.quiesce().await;
    }
}
