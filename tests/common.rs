//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Allocating ephemeral ports
//! - Building per-server test configurations
//! - Running several servers in one process over shared collaborators
//! - Speaking the binary protocol over a real WebSocket

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use imcore::config::Config;
use imcore::delivery::{MemoryHistory, MemoryOfflineStore};
use imcore::groups::MemoryMembership;
use imcore::net::cluster::MemoryCluster;
use imcore::net::wire::{CloseNotice, ImProtoRequest, ImProtoResponse, MsgType};
use imcore::presence::PresenceTable;
use imcore::runtime::{Collaborators, Runtime};
use imcore::store::MemoryStore;
use imcore::time::ManualClock;
use prost::Message as _;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Allocate an ephemeral loopback port. Returns the address with assigned port.
pub fn ephemeral_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// Loopback configuration advertising `server` as its presence name. Idle limits are
/// stretched so that advancing the manual clock does not reap sessions.
pub fn server_config(server: &str) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".into();
    config.server.advertise = Some(server.into());
    config.server.idle_probe_seconds = 3_000;
    config.server.idle_timeout_seconds = 3_600;
    config
}

/// Servers sharing one store, offline queue, history, membership and cluster.
pub struct Fleet {
    pub clock: ManualClock,
    pub store: Arc<MemoryStore<ManualClock>>,
    pub offline: Arc<MemoryOfflineStore>,
    pub history: Arc<MemoryHistory>,
    pub membership: Arc<MemoryMembership>,
    pub cluster: Arc<MemoryCluster>,
    pub servers: Vec<Runtime<ManualClock>>,
}

impl Fleet {
    pub fn new() -> Self {
        let clock = ManualClock::default();
        Self {
            store: Arc::new(MemoryStore::with_clock(clock.clone())),
            offline: Arc::new(MemoryOfflineStore::new()),
            history: Arc::new(MemoryHistory::new()),
            membership: Arc::new(MemoryMembership::new()),
            cluster: Arc::new(MemoryCluster::new()),
            clock,
            servers: Vec::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            offline: self.offline.clone(),
            history: self.history.clone(),
            membership: self.membership.clone(),
            cluster: self.cluster.clone(),
            group_bus: self.cluster.clone(),
        }
    }

    /// Start a server with `config` and return its index.
    pub async fn start(&mut self, config: Config) -> usize {
        let mut runtime =
            Runtime::with_collaborators(config, self.clock.clone(), None, self.collaborators())
                .expect("build runtime");
        runtime.start_for_tests().await.expect("start runtime");
        self.servers.push(runtime);
        self.servers.len() - 1
    }

    pub async fn start_named(&mut self, server: &str) -> usize {
        self.start(server_config(server)).await
    }

    pub fn ws_url(&self, index: usize) -> String {
        let addr = self.servers[index].ws_addr().expect("server started");
        format!("ws://{addr}/websocket")
    }

    /// Connect `user` to server `index` and wait until its presence is published.
    pub async fn connect(&self, index: usize, user: &str) -> Client {
        let client = connect_as(&self.ws_url(index), Some(user))
            .await
            .expect("websocket upgrade");
        self.wait_online(user).await;
        client
    }

    pub async fn wait_online(&self, user: &str) {
        let presence = PresenceTable::new(self.store.clone(), "probe");
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Ok(Some(_)) = presence.lookup(user).await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{user} never came online"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_offline(&self, user: &str) {
        let presence = PresenceTable::new(self.store.clone(), "probe");
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Ok(None) = presence.lookup(user).await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{user} never went offline"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) {
        for runtime in self.servers.iter_mut() {
            runtime.shutdown_for_tests().await.expect("drain runtime");
        }
    }
}

/// Open a WebSocket, identifying with the `uid` header when `user` is set.
pub async fn connect_as(
    url: &str,
    user: Option<&str>,
) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(user) = user {
        request
            .headers_mut()
            .insert("uid", HeaderValue::from_str(user).expect("header value"));
    }
    let (client, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(client)
}

pub async fn send(client: &mut Client, kind: MsgType, payload: &impl prost::Message) {
    let request = ImProtoRequest::new(kind, payload);
    client
        .send(Message::Binary(request.encode_to_vec()))
        .await
        .expect("send frame");
}

/// Next protocol envelope, skipping pings. Panics after a few seconds of silence.
pub async fn recv(client: &mut Client) -> ImProtoResponse {
    try_recv(client, WAIT).await.expect("expected a frame")
}

/// Next protocol envelope within `wait`, or `None` on silence or close.
pub async fn try_recv(client: &mut Client, wait: Duration) -> Option<ImProtoResponse> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let next = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match next.ok()? {
            Message::Binary(bytes) => {
                return Some(ImProtoResponse::decode(bytes.as_slice()).expect("decode response"));
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Receive until an envelope of `kind` arrives.
pub async fn recv_kind(client: &mut Client, kind: MsgType) -> ImProtoResponse {
    loop {
        let response = recv(client).await;
        if response.kind() == kind {
            return response;
        }
    }
}

/// Expect the server's CLOSE envelope carrying `reason`, followed by the socket closing.
pub async fn expect_closed(client: &mut Client, reason: &str) {
    let notice = recv(client).await;
    assert_eq!(notice.kind(), MsgType::Close);
    let close: CloseNotice = notice.payload_as().expect("close notice payload");
    assert_eq!(close.reason, reason);
    assert!(try_recv(client, WAIT).await.is_none());
}
