use super::sharding::GroupShardService;
use crate::net::wire::{GroupMsgPush, ImProtoResponse, MsgType};
use crate::ops::metrics::DeliveryMetrics;
use crate::presence::ConnectionRegistry;
use std::sync::Arc;

/// Pushes a published group message to the members this server hosts.
///
/// Best-effort: no acknowledgement is expected and nothing is retried.
#[derive(Clone)]
pub struct GroupFanout {
    shards: GroupShardService,
    registry: Arc<ConnectionRegistry>,
    metrics: DeliveryMetrics,
}

impl GroupFanout {
    pub fn new(
        shards: GroupShardService,
        registry: Arc<ConnectionRegistry>,
        metrics: DeliveryMetrics,
    ) -> Self {
        Self {
            shards,
            registry,
            metrics,
        }
    }

    /// Returns the number of connections the message was queued on.
    pub async fn deliver(&self, push: &GroupMsgPush) -> usize {
        let members = match self.shards.local_members_of(&push.group_id).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!("group {} fan-out skipped: {err}", push.group_id);
                return 0;
            }
        };
        let response = ImProtoResponse::with_payload(MsgType::GroupMsgPush, push);
        let mut delivered = 0;
        for member in members.iter().filter(|m| **m != push.from) {
            let Some(handle) = self.registry.lookup(member) else {
                continue;
            };
            match handle.push(&response) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!("group push {} to {member} dropped: {err}", push.msg_id);
                }
            }
        }
        self.metrics.group_pushed(delivered);
        delivered
    }
}
