//! Redis pub/sub transport for [`ClusterLink`] and [`GroupBus`].
//!
//! Every server subscribes to its own node channel for forwarded frames and to one shared
//! channel for group messages. Forwarding to a server nobody is subscribed for fails, so
//! the caller can fall back to offline storage.

use super::cluster::{ClusterLink, ForwardedFrame, GroupBus, NODE_QUEUE};
use super::wire::{GroupMsgPush, ImProtoRequest};
use crate::delivery::CollabFuture;
use anyhow::{anyhow, Context};
use futures::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_CHANNEL_PREFIX: &str = "imcore";

/// Pub/sub payload for a relayed request.
#[derive(Clone, PartialEq, Message)]
struct RelayEnvelope {
    #[prost(string, tag = "1")]
    from_server: String,
    #[prost(string, tag = "2")]
    user_id: String,
    #[prost(message, optional, tag = "3")]
    request: Option<ImProtoRequest>,
}

impl RelayEnvelope {
    fn from_frame(frame: ForwardedFrame) -> Self {
        Self {
            from_server: frame.from_server,
            user_id: frame.user_id,
            request: Some(frame.request),
        }
    }

    fn into_frame(self) -> ForwardedFrame {
        ForwardedFrame {
            from_server: self.from_server,
            user_id: self.user_id,
            request: self.request.unwrap_or_default(),
        }
    }
}

fn node_channel(prefix: &str, server: &str) -> String {
    format!("{prefix}:node:{server}")
}

fn group_channel(prefix: &str) -> String {
    format!("{prefix}:groups")
}

pub struct RedisCluster {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
    /// Listener tasks keyed by (server, channel).
    listeners: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl RedisCluster {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("redis connection failed")?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.to_string(),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    async fn publish_bytes(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .with_context(|| format!("publish to {channel} failed"))?;
        Ok(receivers)
    }

    /// Subscribe to `channel` for `server` and decode each payload into the returned queue.
    async fn listen<T, F>(
        &self,
        server: &str,
        channel: String,
        decode: F,
    ) -> anyhow::Result<mpsc::Receiver<T>>
    where
        T: Send + 'static,
        F: Fn(&[u8]) -> Result<T, prost::DecodeError> + Send + 'static,
    {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("redis pubsub connection failed")?;
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("subscribe to {channel} failed"))?;
        let (tx, rx) = mpsc::channel(NODE_QUEUE);
        let name = channel.clone();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match decode(message.get_payload_bytes()) {
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!("undecodable payload on {name}: {err}"),
                }
            }
            tracing::debug!("listener on {name} stopped");
        });
        let key = (server.to_string(), channel);
        if let Some(previous) = self.listeners.lock().insert(key, task) {
            previous.abort();
        }
        Ok(rx)
    }

    fn stop_listening(&self, server: &str, channel: String) {
        if let Some(task) = self.listeners.lock().remove(&(server.to_string(), channel)) {
            task.abort();
        }
    }
}

impl Drop for RedisCluster {
    fn drop(&mut self) {
        for (_, task) in self.listeners.get_mut().drain() {
            task.abort();
        }
    }
}

impl ClusterLink for RedisCluster {
    fn forward<'a>(&'a self, server: &'a str, frame: ForwardedFrame) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            let channel = node_channel(&self.prefix, server);
            let payload = RelayEnvelope::from_frame(frame).encode_to_vec();
            let receivers = self.publish_bytes(&channel, payload).await?;
            if receivers == 0 {
                return Err(anyhow!("server {server} is not in the fleet"));
            }
            Ok(())
        })
    }

    fn attach<'a>(
        &'a self,
        server: &'a str,
    ) -> CollabFuture<'a, mpsc::Receiver<ForwardedFrame>> {
        Box::pin(async move {
            let channel = node_channel(&self.prefix, server);
            self.listen(server, channel, |bytes| {
                RelayEnvelope::decode(bytes).map(RelayEnvelope::into_frame)
            })
            .await
        })
    }

    fn detach<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()> {
        self.stop_listening(server, node_channel(&self.prefix, server));
        Box::pin(std::future::ready(Ok(())))
    }
}

impl GroupBus for RedisCluster {
    fn publish(&self, push: GroupMsgPush) -> CollabFuture<'_, ()> {
        Box::pin(async move {
            let channel = group_channel(&self.prefix);
            let receivers = self.publish_bytes(&channel, push.encode_to_vec()).await?;
            tracing::trace!("group message {} reached {receivers} servers", push.msg_id);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        server: &'a str,
    ) -> CollabFuture<'a, mpsc::Receiver<GroupMsgPush>> {
        Box::pin(async move {
            tracing::debug!("{server} subscribing to the group bus");
            self.listen(server, group_channel(&self.prefix), |bytes| {
                GroupMsgPush::decode(bytes)
            })
            .await
        })
    }

    fn unsubscribe<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()> {
        self.stop_listening(server, group_channel(&self.prefix));
        Box::pin(std::future::ready(Ok(())))
    }
}
