//! WebSocket ingress.
//!
//! Each accepted socket runs one task that reads frames and one writer task that drains
//! the connection's [`Outbound`] queue. Everything touching the shared store beyond the
//! connect gate (shard updates, offline replay, teardown) runs on the session pool.

use super::dispatch::Dispatcher;
use super::wire::{CloseNotice, ImProtoRequest, ImProtoResponse, MsgType};
use crate::admission::{ConnectionLimiter, FlowController, FlowDecision};
use crate::config::ServerConfig;
use crate::delivery::{NoticeKind, OfflineStore, WorkerPool};
use crate::groups::GroupShardService;
use crate::ops::metrics::DeliveryMetrics;
use crate::presence::{ConnectionHandle, ConnectionRegistry, Outbound, PresenceTable};
use crate::time::Clock;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const IDENTITY_HEADER: &str = "uid";
const IDENTITY_QUERY: &str = "userId";
const IDLE_TICK: Duration = Duration::from_secs(1);
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub path: String,
    pub max_frame_bytes: usize,
    pub idle_probe: Duration,
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
}

impl IngressSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            path: config.websocket_path.clone(),
            max_frame_bytes: config.max_frame_bytes,
            idle_probe: config.idle_probe(),
            idle_timeout: config.idle_timeout(),
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// What the upgrade request told us about the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: Option<String>,
    /// Client address after proxy headers.
    pub ip: Option<String>,
    pub path_ok: bool,
}

impl Handshake {
    /// Read identity and client address from the upgrade request. Identity comes from the
    /// `uid` header, then the `userId` query parameter; the address from `X-Forwarded-For`,
    /// then `X-Real-IP`.
    pub fn from_request(req: &Request, path: &str) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let query_user = req.uri().query().and_then(|query| {
            query.split('&').find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                (key == IDENTITY_QUERY && !value.is_empty()).then(|| value.to_string())
            })
        });
        let forwarded = header("x-forwarded-for").and_then(|value| {
            value
                .split(',')
                .map(str::trim)
                .find(|v| !v.is_empty())
                .map(str::to_string)
        });
        Self {
            user_id: header(IDENTITY_HEADER).or(query_user),
            ip: forwarded.or_else(|| header("x-real-ip")),
            path_ok: req.uri().path() == path,
        }
    }
}

/// Everything a socket needs from the rest of the server.
pub struct Ingress<C: Clock> {
    clock: C,
    settings: IngressSettings,
    limiter: ConnectionLimiter,
    flow: FlowController,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTable,
    shards: GroupShardService,
    offline: Arc<dyn OfflineStore>,
    dispatcher: Dispatcher<C>,
    sessions: WorkerPool,
    metrics: DeliveryMetrics,
}

impl<C: Clock> Ingress<C> {
    pub fn new(
        clock: C,
        settings: IngressSettings,
        limiter: ConnectionLimiter,
        flow: FlowController,
        shards: GroupShardService,
        dispatcher: Dispatcher<C>,
        sessions: WorkerPool,
    ) -> Self {
        let svc = dispatcher.ctx();
        Self {
            registry: svc.registry.clone(),
            presence: svc.presence.clone(),
            offline: svc.offline.clone(),
            metrics: svc.metrics.clone(),
            clock,
            settings,
            limiter,
            flow,
            shards,
            dispatcher,
            sessions,
        }
    }

    pub fn sessions(&self) -> &WorkerPool {
        &self.sessions
    }

    pub fn settings(&self) -> &IngressSettings {
        &self.settings
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let captured = Arc::new(Mutex::new(Handshake::default()));
        let sink = captured.clone();
        let path = self.settings.path.clone();
        let upgrade = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let handshake = Handshake::from_request(req, &path);
                let path_ok = handshake.path_ok;
                *sink.lock() = handshake;
                if path_ok {
                    Ok(response)
                } else {
                    let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            },
        )
        .await;
        let mut ws = match upgrade {
            Ok(ws) => ws,
            Err(err) => {
                tracing::debug!("websocket handshake from {peer} failed: {err}");
                return;
            }
        };

        let handshake = captured.lock().clone();
        let ip = handshake.ip.unwrap_or_else(|| peer.ip().to_string());
        let Some(user_id) = handshake.user_id else {
            self.metrics.protocol_violation();
            tracing::warn!("connection from {ip} without identity closed");
            reject(&mut ws, "missing identity").await;
            return;
        };

        if let Err(rejection) = self.limiter.admit(&ip, &user_id).await {
            self.metrics.admission_rejected();
            tracing::info!("connection for {user_id} from {ip} rejected: {rejection}");
            reject(&mut ws, rejection.reason()).await;
            return;
        }

        let (tx, rx) = mpsc::channel(self.settings.outbound_buffer.max(1));
        let handle =
            ConnectionHandle::new(user_id.as_str(), ip.as_str(), self.clock.now_millis(), tx);
        if let Some(old) = self.registry.register(handle.clone()) {
            self.metrics.connection_replaced();
            tracing::info!("connection for {user_id} replaced a previous one");
            old.close("replaced");
        }
        if let Err(err) = self.presence.publish(&user_id).await {
            tracing::warn!("presence publish failed for {user_id}: {err}");
        }
        self.metrics.connection_opened();
        tracing::debug!("connection {} for {user_id} from {ip} registered", handle.id());

        let ingress = self.clone();
        let joined = handle.clone();
        if let Err(err) = self.sessions.try_submit(async move {
            ingress.shards.on_connect(joined.user_id()).await;
            ingress.replay(&joined).await;
        }) {
            tracing::warn!("connect work for {user_id} dropped: {err}");
        }

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(write_loop(sink, rx));
        self.read_loop(&handle, stream, writer).await;
        self.teardown(handle);
    }

    async fn read_loop<S>(
        &self,
        handle: &ConnectionHandle,
        mut stream: S,
        mut writer: JoinHandle<()>,
    ) where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut ticker = tokio::time::interval(IDLE_TICK);
        let mut probed = false;
        let writer_done = loop {
            tokio::select! {
                _ = &mut writer => break true,
                _ = ticker.tick() => {
                    let idle = self.clock.now_millis().saturating_sub(handle.last_activity_ms());
                    if idle >= self.settings.idle_timeout.as_millis() as u64 {
                        tracing::info!("connection for {} idle for {idle}ms, closing", handle.user_id());
                        handle.close("idle timeout");
                        break false;
                    }
                    if !probed && idle >= self.settings.idle_probe.as_millis() as u64 {
                        probed = true;
                        if let Err(err) = handle.probe() {
                            tracing::debug!("heartbeat probe for {} not queued: {err}", handle.user_id());
                        }
                    }
                }
                frame = stream.next() => {
                    let Some(Ok(message)) = frame else {
                        break false;
                    };
                    handle.touch(self.clock.now_millis());
                    probed = false;
                    match self.on_message(handle, message).await {
                        FrameAction::Continue => {}
                        FrameAction::Close => break false,
                        FrameAction::Violation(reason) => {
                            self.metrics.protocol_violation();
                            tracing::info!("closing connection for {}: {reason}", handle.user_id());
                            handle.close(reason);
                            break false;
                        }
                    }
                }
            }
        };
        if !writer_done {
            handle.close("closed");
            if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    async fn on_message(&self, handle: &ConnectionHandle, message: Message) -> FrameAction {
        self.metrics.frame_in();
        match message {
            Message::Binary(data) => {
                if data.len() > self.settings.max_frame_bytes {
                    return FrameAction::Violation("frame too large");
                }
                if !self.admit_frame(handle, data.len()).await {
                    return FrameAction::Continue;
                }
                let request = match ImProtoRequest::decode_frame(&data) {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::debug!("bad frame from {}: {err}", handle.user_id());
                        return FrameAction::Violation("malformed frame");
                    }
                };
                match request.kind() {
                    Ok(MsgType::Heartbeat) => {
                        let pong = ImProtoResponse::success(MsgType::Heartbeat, Vec::new());
                        if let Err(err) = handle.push(&pong) {
                            tracing::debug!("heartbeat reply to {} dropped: {err}", handle.user_id());
                        }
                    }
                    Ok(MsgType::Close) => return FrameAction::Close,
                    _ => {
                        if let Err(err) = self.dispatcher.submit(handle.clone(), request) {
                            tracing::debug!("frame from {} shed: {err}", handle.user_id());
                        }
                    }
                }
                FrameAction::Continue
            }
            Message::Text(text) => {
                if !self.admit_frame(handle, text.len()).await {
                    return FrameAction::Continue;
                }
                FrameAction::Violation("text protocol not supported")
            }
            Message::Ping(data) => {
                // tungstenite answers the ping itself
                self.admit_frame(handle, data.len()).await;
                FrameAction::Continue
            }
            Message::Close(_) => FrameAction::Close,
            Message::Pong(_) | Message::Frame(_) => FrameAction::Continue,
        }
    }

    async fn admit_frame(&self, handle: &ConnectionHandle, size: usize) -> bool {
        match self.flow.check_frame(handle.peer_ip(), size).await {
            FlowDecision::Allow => true,
            FlowDecision::Drop(violation) => {
                self.metrics.frame_throttled();
                tracing::debug!(
                    "frame from {} at {} dropped: {}",
                    handle.user_id(),
                    handle.peer_ip(),
                    violation.label()
                );
                false
            }
        }
    }

    /// Push everything stored while the user was away, oldest first, then delete what was
    /// attempted. Messages go first, then friend requests, friend responses and withdrawals.
    pub async fn replay(&self, handle: &ConnectionHandle) -> usize {
        let user_id = handle.user_id();
        let mut replayed = 0;
        match self.offline.pending_messages(user_id).await {
            Ok(messages) if !messages.is_empty() => {
                let mut attempted = Vec::with_capacity(messages.len());
                for message in &messages {
                    let response =
                        ImProtoResponse::with_payload(MsgType::C2cMsgPush, &message.to_push());
                    if let Err(err) = handle.push(&response) {
                        tracing::debug!("offline replay of {} to {user_id}: {err}", message.msg_id);
                    }
                    attempted.push(message.msg_id);
                }
                replayed += attempted.len();
                if let Err(err) = self.offline.remove_messages(user_id, &attempted).await {
                    tracing::warn!("offline cleanup failed for {user_id}: {err:#}");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("offline messages for {user_id} unavailable: {err:#}"),
        }

        for kind in NoticeKind::ALL {
            let notices = match self.offline.pending_notices(user_id, kind).await {
                Ok(notices) => notices,
                Err(err) => {
                    tracing::warn!("offline {kind:?} notices for {user_id} unavailable: {err:#}");
                    continue;
                }
            };
            if notices.is_empty() {
                continue;
            }
            let mut attempted = Vec::with_capacity(notices.len());
            for notice in notices {
                let response = ImProtoResponse::success(kind.msg_type(), notice.payload);
                if let Err(err) = handle.push(&response) {
                    tracing::debug!("offline {kind:?} notice to {user_id}: {err}");
                }
                attempted.push(notice.notice_id);
            }
            replayed += attempted.len();
            if let Err(err) = self.offline.remove_notices(user_id, &attempted).await {
                tracing::warn!("offline {kind:?} cleanup failed for {user_id}: {err:#}");
            }
        }

        if replayed > 0 {
            self.metrics.offline_replayed(replayed);
            tracing::debug!("replayed {replayed} offline items to {user_id}");
        }
        replayed
    }

    fn teardown(self: &Arc<Self>, handle: ConnectionHandle) {
        let ingress = self.clone();
        let queued = handle.clone();
        let job = async move { ingress.release(queued).await };
        if let Err(err) = self.sessions.try_submit(job) {
            // cleanup must still happen
            tracing::warn!("teardown for {} not queued ({err}), spawning", handle.user_id());
            let ingress = self.clone();
            tokio::spawn(async move { ingress.release(handle).await });
        }
    }

    /// Undo the connect: registry entry, presence, shard slices, admission counters.
    /// Presence and shards are left alone when a newer connection owns the user.
    pub async fn release(&self, handle: ConnectionHandle) {
        let user_id = handle.user_id();
        if self.registry.release(&handle) {
            match self.presence.clear(user_id).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!("presence for {user_id} already moved"),
                Err(err) => tracing::warn!("presence clear failed for {user_id}: {err}"),
            }
            self.shards.on_disconnect(user_id).await;
        }
        self.limiter.release(handle.peer_ip()).await;
        self.metrics.connection_closed();
        tracing::debug!("connection {} for {user_id} released", handle.id());
    }
}

enum FrameAction {
    Continue,
    Close,
    Violation(&'static str),
}

/// Send a CLOSE envelope and close the socket before it was ever registered.
async fn reject(ws: &mut WebSocketStream<TcpStream>, reason: &str) {
    let notice = close_notice(reason);
    let _ = ws.send(notice).await;
    let _ = ws.close(Some(close_frame(reason))).await;
}

fn close_notice(reason: &str) -> Message {
    let response = ImProtoResponse::with_payload(
        MsgType::Close,
        &CloseNotice {
            reason: reason.to_string(),
        },
    );
    Message::Binary(prost::Message::encode_to_vec(&response))
}

fn close_frame(reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(reason.to_string()),
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Frame(bytes) => sink.send(Message::Binary(bytes.to_vec())).await,
            Outbound::Probe => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close(reason) => {
                let _ = sink.send(close_notice(&reason)).await;
                let _ = sink.send(Message::Close(Some(close_frame(&reason)))).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Bind the WebSocket listener and accept until `shutdown` flips.
pub async fn start_ingress<C: Clock>(
    bind: &str,
    ingress: Arc<Ingress<C>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("unable to bind websocket listener {bind}"))?;
    let local = listener
        .local_addr()
        .context("websocket listener has no local address")?;
    tracing::info!("websocket listener on {local}{}", ingress.settings.path);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("websocket listener on {local} stopped");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!("tcp accept error: {err:?}");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(ingress.clone().serve(stream, peer));
                }
            }
        }
    });
    Ok((local, task))
}
