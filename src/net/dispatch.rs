//! Typed request dispatch.
//!
//! Decoded envelopes leave the socket task through a bounded pool and land on the
//! [`MessageHandler`] registered for their [`MsgType`]. Handlers share one
//! [`DeliveryCtx`] holding the service objects built at startup.

use super::cluster::{ClusterLink, ForwardedFrame, GroupBus};
use super::wire::{
    code, AckStatus, BatchMsgIdsReq, BatchMsgIdsResp, C2cAckReq, C2cMsgPush, C2cSendReq,
    GroupMsgPush, GroupSendAck, GroupSendReq, ImProtoRequest, ImProtoResponse, MsgType,
    WireError, WithdrawMsgReq, WithdrawNotification, WithdrawResponse,
};
use crate::delivery::ids::decompose;
use crate::delivery::{
    AckOutcome, Conversation, HistoryRecord, HistoryStore, IdGenerator, NoticeKind,
    OfflineMessage, OfflineStore, PoolError, RetryEngine, WorkerPool,
};
use crate::ops::metrics::{DeliveryMetrics, RouteKind};
use crate::presence::{ConnectionHandle, ConnectionRegistry, PresenceTable, Route};
use crate::time::Clock;
use parking_lot::RwLock;
use prost::Message;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MAX_CONTENT_BYTES: usize = 10_000;
pub const MAX_FORMAT: i32 = 10;
pub const MAX_BATCH_IDS: u32 = 1_000;
pub const DEFAULT_BATCH_IDS: u32 = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid parameter: {0}")]
    Param(String),
    #[error("{0} is not accepted from clients")]
    Forbidden(&'static str),
    #[error("message {msg_id} does not belong to {user_id}")]
    NotOwner { msg_id: u64, user_id: String },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("no handler for {0}")]
    Unhandled(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::Param(_) | DispatchError::Wire(_) | DispatchError::Unhandled(_) => {
                code::PARAM_ERROR
            }
            DispatchError::Forbidden(_) | DispatchError::NotOwner { .. } => code::FORBIDDEN,
            DispatchError::Internal(_) => code::SERVER_ERROR,
        }
    }
}

fn param(message: impl Into<String>) -> DispatchError {
    DispatchError::Param(message.into())
}

/// Where a request came from.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A client socket on this server.
    Local(ConnectionHandle),
    /// Relayed by another server that already validated and acknowledged it.
    Forwarded { from_server: String },
}

#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub user_id: String,
    pub origin: Origin,
}

impl RequestCtx {
    pub fn local(handle: ConnectionHandle) -> Self {
        Self {
            user_id: handle.user_id().to_string(),
            origin: Origin::Local(handle),
        }
    }

    pub fn forwarded(frame: &ForwardedFrame) -> Self {
        Self {
            user_id: frame.user_id.clone(),
            origin: Origin::Forwarded {
                from_server: frame.from_server.clone(),
            },
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self.origin, Origin::Forwarded { .. })
    }

    /// Answer the requesting socket. Forwarded requests have nobody to answer.
    pub fn reply(&self, response: &ImProtoResponse) {
        if let Origin::Local(handle) = &self.origin {
            if let Err(err) = handle.push(response) {
                tracing::debug!(
                    "reply {} to {} dropped: {err}",
                    response.kind().label(),
                    self.user_id
                );
            }
        }
    }
}

/// Shared service objects handed to every handler.
#[derive(Clone)]
pub struct DeliveryCtx<C: Clock> {
    pub clock: C,
    pub ids: Arc<IdGenerator<C>>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceTable,
    pub retry: RetryEngine<C>,
    pub offline: Arc<dyn OfflineStore>,
    pub history: Arc<dyn HistoryStore>,
    pub cluster: Arc<dyn ClusterLink>,
    pub group_bus: Arc<dyn GroupBus>,
    pub metrics: DeliveryMetrics,
    pub withdraw_window: Duration,
}

impl<C: Clock> DeliveryCtx<C> {
    pub fn server(&self) -> &str {
        self.presence.server()
    }

    async fn route(&self, user_id: &str) -> Route {
        match self.presence.route(user_id).await {
            Ok(route) => route,
            Err(err) => {
                // fall back to what this process can see
                tracing::warn!("presence lookup failed for {user_id}: {err}");
                if self.registry.lookup(user_id).is_some() {
                    Route::Local
                } else {
                    Route::Offline
                }
            }
        }
    }

    async fn forward(&self, server: &str, user_id: &str, request: ImProtoRequest) -> bool {
        let frame = ForwardedFrame {
            from_server: self.server().to_string(),
            user_id: user_id.to_string(),
            request,
        };
        match self.cluster.forward(server, frame).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("forward to {server} for {user_id} failed: {err:#}");
                false
            }
        }
    }

    /// Route a direct message to its recipient and report where it went.
    pub async fn deliver_direct(&self, push: &C2cMsgPush) -> RouteKind {
        let kind = match self.route(&push.to).await {
            Route::Local => self.deliver_local(push).await,
            Route::Remote(server) => {
                let request = ImProtoRequest::new(MsgType::C2cSend, &send_from_push(push));
                if self.forward(&server, &push.from, request).await {
                    RouteKind::Remote
                } else {
                    self.store_offline(push).await
                }
            }
            Route::Offline => self.store_offline(push).await,
        };
        self.metrics.routed(kind);
        kind
    }

    /// Push to a locally connected recipient and start tracking the acknowledgement. A
    /// recipient that is gone locally gets the message stored offline.
    pub async fn deliver_local(&self, push: &C2cMsgPush) -> RouteKind {
        let Some(handle) = self.registry.lookup(&push.to) else {
            return self.store_offline(push).await;
        };
        let response = ImProtoResponse::with_payload(MsgType::C2cMsgPush, push);
        if let Err(err) = handle.push(&response) {
            tracing::debug!("push {} to {} not queued: {err}", push.msg_id, push.to);
        }
        // enqueue failures are logged and counted inside the engine
        let _ = self.retry.enqueue(push).await;
        RouteKind::Local
    }

    async fn store_offline(&self, push: &C2cMsgPush) -> RouteKind {
        let message = OfflineMessage {
            msg_id: push.msg_id,
            client_msg_id: push.client_msg_id.clone(),
            from: push.from.clone(),
            to: push.to.clone(),
            chat_id: push.chat_id.clone(),
            format: push.format,
            content: push.content.clone(),
            msg_time: push.time,
            stored_ms: self.clock.now_millis(),
            retry_count: 0,
        };
        if let Err(err) = self.offline.save_message(message).await {
            tracing::error!("offline store failed for {} to {}: {err:#}", push.msg_id, push.to);
        }
        RouteKind::Offline
    }

    /// Deliver a notice to `user_id` wherever it is, or keep it for the next connect.
    pub async fn deliver_notice(&self, user_id: &str, kind: NoticeKind, payload: Vec<u8>) {
        match self.route(user_id).await {
            Route::Local => self.deliver_notice_local(user_id, kind, payload).await,
            Route::Remote(server) => {
                let request = ImProtoRequest {
                    msg_type: kind.msg_type() as i32,
                    payload: payload.clone(),
                };
                if !self.forward(&server, user_id, request).await {
                    self.store_notice(user_id, kind, payload).await;
                }
            }
            Route::Offline => self.store_notice(user_id, kind, payload).await,
        }
    }

    async fn deliver_notice_local(&self, user_id: &str, kind: NoticeKind, payload: Vec<u8>) {
        match self.registry.lookup(user_id) {
            Some(handle) => {
                let response = ImProtoResponse::success(kind.msg_type(), payload);
                if let Err(err) = handle.push(&response) {
                    tracing::debug!("notice to {user_id} not queued: {err}");
                }
            }
            None => self.store_notice(user_id, kind, payload).await,
        }
    }

    async fn store_notice(&self, user_id: &str, kind: NoticeKind, payload: Vec<u8>) {
        if let Err(err) = self.offline.save_notice(user_id, kind, payload).await {
            tracing::error!("offline notice {kind:?} for {user_id} lost: {err:#}");
        }
    }

    /// Pass an acknowledgement on to the original sender. Dropped when they are offline.
    async fn relay_ack(&self, ack: &C2cAckReq) {
        match self.route(&ack.to).await {
            Route::Local => {
                if let Some(handle) = self.registry.lookup(&ack.to) {
                    let response = ImProtoResponse::with_payload(MsgType::C2cAck, ack);
                    if let Err(err) = handle.push(&response) {
                        tracing::debug!("ack relay to {} not queued: {err}", ack.to);
                    }
                }
            }
            Route::Remote(server) => {
                let request = ImProtoRequest::new(MsgType::C2cAck, ack);
                self.forward(&server, &ack.from, request).await;
            }
            Route::Offline => {}
        }
    }

    async fn write_history(&self, record: HistoryRecord) {
        let msg_id = record.msg_id;
        if let Err(err) = self.history.record(record).await {
            tracing::warn!("history write failed for {msg_id}: {err:#}");
        }
    }
}

fn send_from_push(push: &C2cMsgPush) -> C2cSendReq {
    C2cSendReq {
        msg_id: push.msg_id,
        client_msg_id: push.client_msg_id.clone(),
        from: push.from.clone(),
        to: push.to.clone(),
        format: push.format,
        content: push.content.clone(),
        time: push.time,
        chat_id: push.chat_id.clone(),
    }
}

fn server_ack(
    msg_id: u64,
    client_msg_id: &str,
    to: &str,
    status: AckStatus,
    time: u64,
) -> ImProtoResponse {
    let ack = C2cAckReq {
        msg_id,
        client_msg_id: client_msg_id.to_string(),
        from: String::new(),
        to: to.to_string(),
        status: status as i32,
        chat_id: String::new(),
        time,
    };
    ImProtoResponse::with_payload(MsgType::C2cAck, &ack)
}

fn validate_content(content: &str, client_msg_id: &str) -> Result<(), DispatchError> {
    if client_msg_id.is_empty() {
        return Err(param("client_msg_id is required"));
    }
    if content.is_empty() {
        return Err(param("content is required"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(param(format!("content exceeds {MAX_CONTENT_BYTES} bytes")));
    }
    Ok(())
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;

pub trait MessageHandler<C: Clock>: Send + Sync {
    fn name(&self) -> &'static str;
    fn kinds(&self) -> &'static [MsgType];
    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a>;
}

pub struct HandlerRegistry<C: Clock> {
    handlers: RwLock<HashMap<MsgType, Arc<dyn MessageHandler<C>>>>,
}

impl<C: Clock> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Clock> HandlerRegistry<C> {
    pub fn register(&self, handler: Arc<dyn MessageHandler<C>>) {
        let mut guard = self.handlers.write();
        for kind in handler.kinds() {
            guard.insert(*kind, handler.clone());
        }
    }

    pub fn handler_for(&self, kind: MsgType) -> Option<Arc<dyn MessageHandler<C>>> {
        self.handlers.read().get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<MsgType> {
        let mut kinds: Vec<MsgType> = self.handlers.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Registry with every client-facing and cluster-facing handler.
    pub fn with_builtin() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(C2cSendHandler));
        registry.register(Arc::new(C2cAckHandler));
        registry.register(Arc::new(WithdrawHandler));
        registry.register(Arc::new(GroupSendHandler));
        registry.register(Arc::new(BatchIdsHandler));
        registry.register(Arc::new(NoticeHandler));
        registry
    }
}

struct C2cSendHandler;

impl<C: Clock> MessageHandler<C> for C2cSendHandler {
    fn name(&self) -> &'static str {
        "c2c_send"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[MsgType::C2cSend]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let req: C2cSendReq = request.payload_as()?;
            if ctx.is_forwarded() {
                // the sending server already assigned the id, wrote history and acked
                let push = push_from_send(&req);
                let kind = svc.deliver_local(&push).await;
                svc.metrics.routed(kind);
                return Ok(());
            }
            if req.to.is_empty() {
                return Err(param("to is required"));
            }
            validate_content(&req.content, &req.client_msg_id)?;
            if !(0..=MAX_FORMAT).contains(&req.format) {
                return Err(param(format!("format must be within 0..={MAX_FORMAT}")));
            }

            let now = svc.clock.now_millis();
            let mut push = push_from_send(&req);
            push.from = ctx.user_id.clone();
            if push.msg_id == 0 {
                push.msg_id = svc.ids.next_id();
            }
            if push.time == 0 {
                push.time = now;
            }
            svc.write_history(HistoryRecord {
                msg_id: push.msg_id,
                client_msg_id: push.client_msg_id.clone(),
                from: push.from.clone(),
                target: push.to.clone(),
                chat_id: push.chat_id.clone(),
                conversation: Conversation::Direct,
                format: push.format,
                content: push.content.clone(),
                msg_time: push.time,
                received_ms: now,
            })
            .await;

            let route = svc.deliver_direct(&push).await;
            ctx.reply(&server_ack(
                push.msg_id,
                &push.client_msg_id,
                &push.from,
                AckStatus::ServerReceived,
                now,
            ));
            if matches!(route, RouteKind::Offline) {
                ctx.reply(&server_ack(
                    push.msg_id,
                    &push.client_msg_id,
                    &push.from,
                    AckStatus::OfflineUnread,
                    now,
                ));
            }
            Ok(())
        })
    }
}

fn push_from_send(req: &C2cSendReq) -> C2cMsgPush {
    C2cMsgPush {
        msg_id: req.msg_id,
        client_msg_id: req.client_msg_id.clone(),
        from: req.from.clone(),
        to: req.to.clone(),
        format: req.format,
        content: req.content.clone(),
        time: req.time,
        chat_id: req.chat_id.clone(),
        retry_count: 0,
    }
}

struct C2cAckHandler;

impl<C: Clock> MessageHandler<C> for C2cAckHandler {
    fn name(&self) -> &'static str {
        "c2c_ack"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[MsgType::C2cAck]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut ack: C2cAckReq = request.payload_as()?;
            if ctx.is_forwarded() {
                if let Some(handle) = svc.registry.lookup(&ack.to) {
                    let response = ImProtoResponse::with_payload(MsgType::C2cAck, &ack);
                    if let Err(err) = handle.push(&response) {
                        tracing::debug!("ack relay to {} not queued: {err}", ack.to);
                    }
                }
                return Ok(());
            }
            if ack.msg_id == 0 {
                return Err(param("msg_id is required"));
            }
            if ack.client_msg_id.is_empty() {
                return Err(param("client_msg_id is required"));
            }
            let Some(status) = ack.ack_status() else {
                return Err(param("status must be within 1..=4"));
            };
            ack.from = ctx.user_id.clone();

            match svc.retry.acknowledge(ack.msg_id, &ctx.user_id).await {
                Ok(AckOutcome::Cancelled) => {
                    tracing::debug!("retry for {} cancelled by ack", ack.msg_id);
                }
                Ok(AckOutcome::NotPending) => {}
                Ok(AckOutcome::WrongRecipient { recipient }) => {
                    tracing::warn!(
                        "ack for {} from {} ignored, addressed to {recipient}",
                        ack.msg_id,
                        ctx.user_id
                    );
                    return Err(DispatchError::NotOwner {
                        msg_id: ack.msg_id,
                        user_id: ctx.user_id.clone(),
                    });
                }
                Err(err) => tracing::warn!("retry cancel failed for {}: {err}", ack.msg_id),
            }
            if let Err(err) = svc.history.update_status(ack.msg_id, status).await {
                tracing::warn!("history status update failed for {}: {err:#}", ack.msg_id);
            }
            if !ack.to.is_empty() {
                svc.relay_ack(&ack).await;
            }
            Ok(())
        })
    }
}

struct WithdrawHandler;

impl<C: Clock> MessageHandler<C> for WithdrawHandler {
    fn name(&self) -> &'static str {
        "withdraw"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[MsgType::WithdrawMsgSend]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if ctx.is_forwarded() {
                return Err(DispatchError::Forbidden("forwarded withdraw"));
            }
            let req: WithdrawMsgReq = request.payload_as()?;
            if req.msg_id == 0 {
                return Err(param("msg_id is required"));
            }
            if req.client_msg_id.is_empty() {
                return Err(param("client_msg_id is required"));
            }
            if req.to.is_empty() {
                return Err(param("to is required"));
            }
            let sent_at = match svc.history.lookup(req.msg_id).await {
                Ok(Some(record)) if record.from != ctx.user_id => {
                    return Err(DispatchError::NotOwner {
                        msg_id: req.msg_id,
                        user_id: ctx.user_id.clone(),
                    });
                }
                Ok(Some(record)) => record.received_ms,
                Ok(None) => decompose(req.msg_id).timestamp_ms,
                Err(err) => {
                    tracing::warn!("history lookup failed for {}: {err:#}", req.msg_id);
                    decompose(req.msg_id).timestamp_ms
                }
            };
            let now = svc.clock.now_millis();
            let window = svc.withdraw_window.as_millis() as u64;
            if now.saturating_sub(sent_at) > window {
                let response = WithdrawResponse {
                    msg_id: req.msg_id,
                    client_msg_id: req.client_msg_id.clone(),
                    success: false,
                    reason: format!("messages can only be withdrawn within {}s", window / 1_000),
                };
                ctx.reply(&ImProtoResponse::with_payload(
                    MsgType::WithdrawMsgResponse,
                    &response,
                ));
                return Ok(());
            }

            if let Err(err) = svc.retry.cancel(req.msg_id).await {
                tracing::warn!("retry cancel failed for withdrawn {}: {err}", req.msg_id);
            }
            if let Err(err) = svc
                .history
                .mark_withdrawn(req.msg_id, &ctx.user_id, now)
                .await
            {
                tracing::warn!("history withdraw mark failed for {}: {err:#}", req.msg_id);
            }
            let notice = WithdrawNotification {
                msg_id: req.msg_id,
                client_msg_id: req.client_msg_id.clone(),
                from: ctx.user_id.clone(),
                to: req.to.clone(),
                chat_id: req.chat_id.clone(),
                time: now,
            };
            svc.deliver_notice(&req.to, NoticeKind::Withdraw, notice.encode_to_vec())
                .await;
            let response = WithdrawResponse {
                msg_id: req.msg_id,
                client_msg_id: req.client_msg_id,
                success: true,
                reason: String::new(),
            };
            ctx.reply(&ImProtoResponse::with_payload(
                MsgType::WithdrawMsgResponse,
                &response,
            ));
            Ok(())
        })
    }
}

struct GroupSendHandler;

impl<C: Clock> MessageHandler<C> for GroupSendHandler {
    fn name(&self) -> &'static str {
        "group_send"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[MsgType::GroupSend]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if ctx.is_forwarded() {
                return Err(DispatchError::Forbidden("forwarded group send"));
            }
            let req: GroupSendReq = request.payload_as()?;
            if req.group_id.is_empty() {
                return Err(param("group_id is required"));
            }
            validate_content(&req.content, &req.client_msg_id)?;
            if !(0..=MAX_FORMAT).contains(&req.format) {
                return Err(param(format!("format must be within 0..={MAX_FORMAT}")));
            }
            let msg_id = if req.msg_id == 0 {
                svc.ids.next_id()
            } else {
                req.msg_id
            };
            let time = if req.time == 0 {
                svc.clock.now_millis()
            } else {
                req.time
            };
            let push = GroupMsgPush {
                msg_id,
                client_msg_id: req.client_msg_id.clone(),
                from: ctx.user_id.clone(),
                group_id: req.group_id.clone(),
                format: req.format,
                content: req.content.clone(),
                time,
                chat_id: req.group_id.clone(),
            };
            svc.write_history(HistoryRecord {
                msg_id,
                client_msg_id: push.client_msg_id.clone(),
                from: push.from.clone(),
                target: push.group_id.clone(),
                chat_id: push.chat_id.clone(),
                conversation: Conversation::Group,
                format: push.format,
                content: push.content.clone(),
                msg_time: time,
                received_ms: svc.clock.now_millis(),
            })
            .await;
            if let Err(err) = svc.group_bus.publish(push).await {
                tracing::warn!("group bus publish of {msg_id} failed: {err:#}");
                return Err(DispatchError::Internal("group publish failed".into()));
            }
            ctx.reply(&ImProtoResponse::with_payload(
                MsgType::GroupSend,
                &GroupSendAck {
                    msg_id,
                    client_msg_id: req.client_msg_id,
                },
            ));
            Ok(())
        })
    }
}

struct BatchIdsHandler;

impl<C: Clock> MessageHandler<C> for BatchIdsHandler {
    fn name(&self) -> &'static str {
        "batch_ids"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[MsgType::GetBatchMsgIds]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let req: BatchMsgIdsReq = request.payload_as()?;
            let count = match req.count {
                0 => DEFAULT_BATCH_IDS,
                n if n > MAX_BATCH_IDS => {
                    return Err(param(format!("count must be within 1..={MAX_BATCH_IDS}")));
                }
                n => n,
            };
            let response = BatchMsgIdsResp {
                msg_ids: svc.ids.next_batch(count as usize),
            };
            ctx.reply(&ImProtoResponse::with_payload(
                MsgType::PushBatchMsgIds,
                &response,
            ));
            Ok(())
        })
    }
}

/// Notices relayed from another server for a user connected here.
struct NoticeHandler;

impl<C: Clock> MessageHandler<C> for NoticeHandler {
    fn name(&self) -> &'static str {
        "notice"
    }

    fn kinds(&self) -> &'static [MsgType] {
        &[
            MsgType::FriendRequest,
            MsgType::FriendResponse,
            MsgType::MsgWithdrawNotification,
        ]
    }

    fn handle<'a>(
        &'a self,
        svc: &'a DeliveryCtx<C>,
        ctx: &'a RequestCtx,
        request: &'a ImProtoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let kind = match request.kind()? {
                MsgType::FriendRequest => NoticeKind::FriendRequest,
                MsgType::FriendResponse => NoticeKind::FriendResponse,
                _ => NoticeKind::Withdraw,
            };
            if !ctx.is_forwarded() {
                return Err(DispatchError::Forbidden(kind.msg_type().label()));
            }
            svc.deliver_notice_local(&ctx.user_id, kind, request.payload.clone())
                .await;
            Ok(())
        })
    }
}

/// Runs handlers off the socket tasks.
#[derive(Clone)]
pub struct Dispatcher<C: Clock> {
    svc: DeliveryCtx<C>,
    handlers: Arc<HandlerRegistry<C>>,
    pool: WorkerPool,
}

impl<C: Clock> Dispatcher<C> {
    pub fn new(svc: DeliveryCtx<C>, handlers: Arc<HandlerRegistry<C>>, pool: WorkerPool) -> Self {
        Self {
            svc,
            handlers,
            pool,
        }
    }

    pub fn ctx(&self) -> &DeliveryCtx<C> {
        &self.svc
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Queue a client request. A saturated queue drops the frame.
    pub fn submit(
        &self,
        handle: ConnectionHandle,
        request: ImProtoRequest,
    ) -> Result<(), PoolError> {
        let dispatcher = self.clone();
        let submitted = self.pool.try_submit(async move {
            dispatcher.handle(RequestCtx::local(handle), request).await;
        });
        if submitted.is_err() {
            self.svc.metrics.dispatch_dropped();
        }
        submitted
    }

    /// Queue a request relayed by another server.
    pub fn submit_forwarded(&self, frame: ForwardedFrame) -> Result<(), PoolError> {
        let dispatcher = self.clone();
        let submitted = self.pool.try_submit(async move {
            let ctx = RequestCtx::forwarded(&frame);
            dispatcher.handle(ctx, frame.request).await;
        });
        if submitted.is_err() {
            self.svc.metrics.dispatch_dropped();
        }
        submitted
    }

    /// Run the handler for `request` and answer failures with an error response.
    pub async fn handle(&self, ctx: RequestCtx, request: ImProtoRequest) {
        let kind = match request.kind() {
            Ok(kind) => kind,
            Err(err) => {
                ctx.reply(&ImProtoResponse::error(
                    MsgType::Unknown,
                    code::PARAM_ERROR,
                    err.to_string(),
                ));
                return;
            }
        };
        let result = match self.handlers.handler_for(kind) {
            Some(handler) => handler.handle(&self.svc, &ctx, &request).await,
            None => Err(DispatchError::Unhandled(kind.label())),
        };
        if let Err(err) = result {
            match &ctx.origin {
                Origin::Local(_) => {
                    tracing::debug!("{} from {} rejected: {err}", kind.label(), ctx.user_id);
                    ctx.reply(&ImProtoResponse::error(kind, err.code(), err.to_string()));
                }
                Origin::Forwarded { from_server } => {
                    tracing::warn!(
                        "forwarded {} for {} from {from_server} failed: {err}",
                        kind.label(),
                        ctx.user_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{MemoryHistory, MemoryOfflineStore, RetrySettings};
    use crate::net::cluster::{ClusterLink, MemoryCluster};
    use crate::presence::Outbound;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;
    use tokio::sync::mpsc;

    struct Node {
        dispatcher: Dispatcher<ManualClock>,
        store: Arc<MemoryStore<ManualClock>>,
        offline: Arc<MemoryOfflineStore>,
        history: Arc<MemoryHistory>,
        clock: ManualClock,
    }

    fn node(
        server: &str,
        clock: ManualClock,
        store: Arc<MemoryStore<ManualClock>>,
        cluster: Arc<MemoryCluster>,
    ) -> Node {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceTable::new(store.clone(), server);
        let offline = Arc::new(MemoryOfflineStore::new());
        let history = Arc::new(MemoryHistory::new());
        let metrics = DeliveryMetrics::default();
        let retry = RetryEngine::new(
            clock.clone(),
            store.clone(),
            registry.clone(),
            presence.clone(),
            offline.clone(),
            WorkerPool::new("resend", 1, 16),
            metrics.clone(),
            RetrySettings::default(),
        );
        let svc = DeliveryCtx {
            clock: clock.clone(),
            ids: Arc::new(IdGenerator::new(clock.clone(), 1, 1).unwrap()),
            registry,
            presence,
            retry,
            offline: offline.clone(),
            history: history.clone(),
            cluster: cluster.clone(),
            group_bus: cluster,
            metrics,
            withdraw_window: Duration::from_secs(120),
        };
        let dispatcher = Dispatcher::new(
            svc,
            Arc::new(HandlerRegistry::with_builtin()),
            WorkerPool::new("dispatch", 2, 64),
        );
        Node {
            dispatcher,
            store,
            offline,
            history,
            clock,
        }
    }

    fn single() -> Node {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        node("s1", clock, store, Arc::new(MemoryCluster::new()))
    }

    async fn connect(node: &Node, user: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = ConnectionHandle::new(user, "10.0.0.1", node.clock.now_millis(), tx);
        let svc = node.dispatcher.ctx();
        svc.registry.register(handle.clone());
        svc.presence.publish(user).await.unwrap();
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ImProtoResponse> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(bytes) = item {
                out.push(ImProtoResponse::decode(bytes).unwrap());
            }
        }
        out
    }

    fn send(to: &str, content: &str) -> ImProtoRequest {
        ImProtoRequest::new(
            MsgType::C2cSend,
            &C2cSendReq {
                client_msg_id: "c-1".into(),
                from: "spoofed".into(),
                to: to.into(),
                content: content.into(),
                format: 1,
                chat_id: "chat".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_local_send_pushes_acks_and_tracks_retry() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let (_bob, mut bob_rx) = connect(&n, "bob").await;

        n.dispatcher
            .handle(RequestCtx::local(alice), send("bob", "hi"))
            .await;

        let pushed = drain(&mut bob_rx);
        assert_eq!(pushed.len(), 1);
        let push: C2cMsgPush = pushed[0].payload_as().unwrap();
        assert_eq!(push.from, "alice");
        assert_ne!(push.msg_id, 0);

        let acks = drain(&mut alice_rx);
        assert_eq!(acks.len(), 1);
        let ack: C2cAckReq = acks[0].payload_as().unwrap();
        assert_eq!(ack.ack_status(), Some(AckStatus::ServerReceived));
        assert_eq!(ack.msg_id, push.msg_id);

        assert!(n.store.is_indexed(&push.msg_id.to_string()));
        assert!(n.history.get(push.msg_id).unwrap().record.is_some());
    }

    #[tokio::test]
    async fn test_offline_recipient_gets_stored_and_sender_told() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        n.dispatcher
            .handle(RequestCtx::local(alice), send("carol", "later"))
            .await;
        assert_eq!(n.offline.message_count("carol"), 1);
        let statuses: Vec<Option<AckStatus>> = drain(&mut alice_rx)
            .iter()
            .map(|r| r.payload_as::<C2cAckReq>().unwrap().ack_status())
            .collect();
        assert_eq!(
            statuses,
            vec![Some(AckStatus::ServerReceived), Some(AckStatus::OfflineUnread)]
        );
    }

    #[tokio::test]
    async fn test_invalid_send_answers_400_and_keeps_going() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let big = "x".repeat(MAX_CONTENT_BYTES + 1);
        n.dispatcher
            .handle(RequestCtx::local(alice.clone()), send("bob", &big))
            .await;
        n.dispatcher
            .handle(RequestCtx::local(alice), send("", "hi"))
            .await;
        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.code == code::PARAM_ERROR));
    }

    #[tokio::test]
    async fn test_ack_cancels_retry_and_relays_to_sender() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let (bob, mut bob_rx) = connect(&n, "bob").await;
        n.dispatcher
            .handle(RequestCtx::local(alice), send("bob", "hi"))
            .await;
        let push: C2cMsgPush = drain(&mut bob_rx)[0].payload_as().unwrap();
        drain(&mut alice_rx);

        let ack = ImProtoRequest::new(
            MsgType::C2cAck,
            &C2cAckReq {
                msg_id: push.msg_id,
                client_msg_id: push.client_msg_id.clone(),
                to: "alice".into(),
                status: AckStatus::Read as i32,
                ..Default::default()
            },
        );
        n.dispatcher
            .handle(RequestCtx::local(bob.clone()), ack.clone())
            .await;
        assert!(!n.store.is_indexed(&push.msg_id.to_string()));
        assert_eq!(
            n.history.get(push.msg_id).unwrap().status,
            Some(AckStatus::Read)
        );
        let relayed: C2cAckReq = drain(&mut alice_rx)[0].payload_as().unwrap();
        assert_eq!(relayed.from, "bob");

        // a duplicate ack is silent
        n.dispatcher.handle(RequestCtx::local(bob), ack).await;
        assert!(drain(&mut bob_rx).is_empty());
    }

    fn withdraw(msg_id: u64, msg_time: u64) -> ImProtoRequest {
        ImProtoRequest::new(
            MsgType::WithdrawMsgSend,
            &WithdrawMsgReq {
                msg_id,
                client_msg_id: format!("c-{msg_id}"),
                to: "bob".into(),
                msg_time,
                ..Default::default()
            },
        )
    }

    async fn sent(n: &Node, msg_id: u64, from: &str, received_ms: u64) {
        n.history
            .record(HistoryRecord {
                msg_id,
                client_msg_id: format!("c-{msg_id}"),
                from: from.into(),
                target: "bob".into(),
                chat_id: "chat".into(),
                conversation: Conversation::Direct,
                format: 1,
                content: "oops".into(),
                msg_time: received_ms,
                received_ms,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_window_enforced() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let now = n.clock.now_millis();
        sent(&n, 9, "alice", now - 5_000).await;
        sent(&n, 10, "alice", now - 121_000).await;

        // the client-supplied time is not trusted
        n.dispatcher
            .handle(RequestCtx::local(alice.clone()), withdraw(10, now))
            .await;
        let late: WithdrawResponse = drain(&mut alice_rx)[0].payload_as().unwrap();
        assert!(!late.success);
        assert!(n.history.get(10).unwrap().withdrawn_at.is_none());

        n.dispatcher
            .handle(RequestCtx::local(alice), withdraw(9, 0))
            .await;
        let ok: WithdrawResponse = drain(&mut alice_rx)[0].payload_as().unwrap();
        assert!(ok.success);
        assert_eq!(n.offline.notice_count("bob"), 1);
        assert!(n.history.get(9).unwrap().withdrawn_at.is_some());
    }

    #[tokio::test]
    async fn test_withdraw_without_history_uses_id_time() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let fresh = n.dispatcher.ctx().ids.next_id();
        n.dispatcher
            .handle(RequestCtx::local(alice.clone()), withdraw(fresh, 0))
            .await;
        let ok: WithdrawResponse = drain(&mut alice_rx)[0].payload_as().unwrap();
        assert!(ok.success);

        n.clock.advance(Duration::from_secs(121));
        n.dispatcher
            .handle(RequestCtx::local(alice), withdraw(fresh, n.clock.now_millis()))
            .await;
        let late: WithdrawResponse = drain(&mut alice_rx)[0].payload_as().unwrap();
        assert!(!late.success);
    }

    #[tokio::test]
    async fn test_only_sender_may_withdraw() {
        let n = single();
        let (mallory, mut mallory_rx) = connect(&n, "mallory").await;
        sent(&n, 11, "alice", n.clock.now_millis()).await;
        n.dispatcher
            .handle(RequestCtx::local(mallory), withdraw(11, 0))
            .await;
        assert_eq!(drain(&mut mallory_rx)[0].code, code::FORBIDDEN);
        assert!(n.history.get(11).unwrap().withdrawn_at.is_none());
        assert_eq!(n.offline.notice_count("bob"), 0);
    }

    #[tokio::test]
    async fn test_ack_from_other_user_keeps_retry() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        let (_bob, mut bob_rx) = connect(&n, "bob").await;
        let (carol, mut carol_rx) = connect(&n, "carol").await;
        n.dispatcher
            .handle(RequestCtx::local(alice), send("bob", "hi"))
            .await;
        let push: C2cMsgPush = drain(&mut bob_rx)[0].payload_as().unwrap();
        drain(&mut alice_rx);

        let ack = ImProtoRequest::new(
            MsgType::C2cAck,
            &C2cAckReq {
                msg_id: push.msg_id,
                client_msg_id: push.client_msg_id.clone(),
                to: "alice".into(),
                status: AckStatus::Read as i32,
                ..Default::default()
            },
        );
        n.dispatcher.handle(RequestCtx::local(carol), ack).await;
        assert_eq!(drain(&mut carol_rx)[0].code, code::FORBIDDEN);
        assert!(n.store.is_indexed(&push.msg_id.to_string()));
        assert!(n.history.get(push.msg_id).unwrap().status.is_none());
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_batch_ids_bounds() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        for count in [0u32, 5, 1_001] {
            n.dispatcher
                .handle(
                    RequestCtx::local(alice.clone()),
                    ImProtoRequest::new(MsgType::GetBatchMsgIds, &BatchMsgIdsReq { count }),
                )
                .await;
        }
        let replies = drain(&mut alice_rx);
        let first: BatchMsgIdsResp = replies[0].payload_as().unwrap();
        let second: BatchMsgIdsResp = replies[1].payload_as().unwrap();
        assert_eq!(first.msg_ids.len(), 100);
        assert_eq!(second.msg_ids.len(), 5);
        assert_eq!(replies[2].code, code::PARAM_ERROR);
    }

    #[tokio::test]
    async fn test_clients_cannot_send_friend_notices() {
        let n = single();
        let (alice, mut alice_rx) = connect(&n, "alice").await;
        n.dispatcher
            .handle(
                RequestCtx::local(alice),
                ImProtoRequest {
                    msg_type: MsgType::FriendRequest as i32,
                    payload: Vec::new(),
                },
            )
            .await;
        assert_eq!(drain(&mut alice_rx)[0].code, code::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_remote_recipient_is_forwarded() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cluster = Arc::new(MemoryCluster::new());
        let _s1_frames = cluster.attach("s1").await.unwrap();
        let mut s2_frames = cluster.attach("s2").await.unwrap();
        let s1 = node("s1", clock.clone(), store.clone(), cluster.clone());
        let s2 = node("s2", clock, store, cluster);
        let (alice, _alice_rx) = connect(&s1, "alice").await;
        let (_bob, mut bob_rx) = connect(&s2, "bob").await;

        s1.dispatcher
            .handle(RequestCtx::local(alice), send("bob", "across"))
            .await;
        let frame = s2_frames.recv().await.expect("forwarded frame");
        assert_eq!(frame.from_server, "s1");
        s2.dispatcher
            .handle(RequestCtx::forwarded(&frame), frame.request.clone())
            .await;
        let push: C2cMsgPush = drain(&mut bob_rx)[0].payload_as().unwrap();
        assert_eq!(push.content, "across");
        assert!(s2.store.is_indexed(&push.msg_id.to_string()));
    }
}
