//! Cross-server plumbing.
//!
//! [`ClusterLink`] carries a request to the server that owns a user's connection;
//! [`GroupBus`] broadcasts group messages to every server. Each server attaches to both
//! at startup and drains the returned queues. [`MemoryCluster`] implements both for
//! servers living in one process; [`super::redis_cluster::RedisCluster`] spans processes.

use super::wire::{GroupMsgPush, ImProtoRequest};
use crate::delivery::CollabFuture;
use anyhow::anyhow;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

pub(crate) const NODE_QUEUE: usize = 4_096;

/// A client request relayed to the server that can act on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedFrame {
    pub from_server: String,
    /// User on whose behalf the request was made.
    pub user_id: String,
    pub request: ImProtoRequest,
}

pub trait ClusterLink: Send + Sync {
    fn forward<'a>(&'a self, server: &'a str, frame: ForwardedFrame) -> CollabFuture<'a, ()>;

    /// Start receiving frames addressed to `server`. Attaching again replaces the queue.
    fn attach<'a>(&'a self, server: &'a str)
        -> CollabFuture<'a, mpsc::Receiver<ForwardedFrame>>;

    fn detach<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()>;
}

pub trait GroupBus: Send + Sync {
    fn publish(&self, push: GroupMsgPush) -> CollabFuture<'_, ()>;

    /// Start receiving every published group message on behalf of `server`.
    fn subscribe<'a>(&'a self, server: &'a str)
        -> CollabFuture<'a, mpsc::Receiver<GroupMsgPush>>;

    fn unsubscribe<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()>;
}

/// In-process fleet: each attached server drains its own bounded queues.
#[derive(Default)]
pub struct MemoryCluster {
    links: RwLock<HashMap<String, mpsc::Sender<ForwardedFrame>>>,
    subscribers: RwLock<HashMap<String, mpsc::Sender<GroupMsgPush>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Servers currently attached to the link.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.links.read().keys().cloned().collect();
        members.sort();
        members
    }

    pub fn subscribers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self.subscribers.read().keys().cloned().collect();
        servers.sort();
        servers
    }
}

fn ready<'a, T: Send + 'a>(result: anyhow::Result<T>) -> CollabFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl ClusterLink for MemoryCluster {
    fn forward<'a>(&'a self, server: &'a str, frame: ForwardedFrame) -> CollabFuture<'a, ()> {
        let tx = self.links.read().get(server).cloned();
        let result = match tx {
            Some(tx) => tx
                .try_send(frame)
                .map_err(|err| anyhow!("queue to {server} rejected frame: {err}")),
            None => Err(anyhow!("server {server} is not in the fleet")),
        };
        ready(result)
    }

    fn attach<'a>(
        &'a self,
        server: &'a str,
    ) -> CollabFuture<'a, mpsc::Receiver<ForwardedFrame>> {
        let (tx, rx) = mpsc::channel(NODE_QUEUE);
        self.links.write().insert(server.to_string(), tx);
        ready(Ok(rx))
    }

    fn detach<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()> {
        self.links.write().remove(server);
        ready(Ok(()))
    }
}

impl GroupBus for MemoryCluster {
    fn publish(&self, push: GroupMsgPush) -> CollabFuture<'_, ()> {
        let subscribers: Vec<(String, mpsc::Sender<GroupMsgPush>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(server, tx)| (server.clone(), tx.clone()))
            .collect();
        for (server, tx) in subscribers {
            if let Err(err) = tx.try_send(push.clone()) {
                tracing::warn!("group bus publish of {} skipped {server}: {err}", push.msg_id);
            }
        }
        ready(Ok(()))
    }

    fn subscribe<'a>(
        &'a self,
        server: &'a str,
    ) -> CollabFuture<'a, mpsc::Receiver<GroupMsgPush>> {
        let (tx, rx) = mpsc::channel(NODE_QUEUE);
        self.subscribers.write().insert(server.to_string(), tx);
        ready(Ok(rx))
    }

    fn unsubscribe<'a>(&'a self, server: &'a str) -> CollabFuture<'a, ()> {
        self.subscribers.write().remove(server);
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::MsgType;

    fn frame() -> ForwardedFrame {
        ForwardedFrame {
            from_server: "s1".into(),
            user_id: "alice".into(),
            request: ImProtoRequest {
                msg_type: MsgType::C2cSend as i32,
                payload: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_forward_reaches_named_server_only() {
        let cluster = MemoryCluster::new();
        let mut s1 = cluster.attach("s1").await.unwrap();
        let mut s2 = cluster.attach("s2").await.unwrap();
        cluster.forward("s2", frame()).await.unwrap();
        assert_eq!(s2.recv().await, Some(frame()));
        assert!(s1.try_recv().is_err());
        assert!(cluster.forward("s9", frame()).await.is_err());

        cluster.detach("s2").await.unwrap();
        assert_eq!(cluster.members(), vec!["s1".to_string()]);
        assert!(cluster.forward("s2", frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_group_publish_reaches_every_subscriber() {
        let cluster = MemoryCluster::new();
        let mut s1 = cluster.subscribe("s1").await.unwrap();
        let mut s2 = cluster.subscribe("s2").await.unwrap();
        let push = GroupMsgPush {
            msg_id: 7,
            group_id: "g1".into(),
            ..Default::default()
        };
        cluster.publish(push.clone()).await.unwrap();
        assert_eq!(s1.recv().await, Some(push.clone()));
        assert_eq!(s2.recv().await, Some(push));

        cluster.unsubscribe("s1").await.unwrap();
        assert_eq!(cluster.subscribers(), vec!["s2".to_string()]);
    }
}
