//! Binary wire schema.
//!
//! Every frame is a WebSocket binary message carrying one protobuf envelope:
//! [`ImProtoRequest`] from clients, [`ImProtoResponse`] from the server. The envelope
//! payload is itself a protobuf message selected by [`MsgType`].

use prost::Message;
use thiserror::Error;

/// Response codes carried in [`ImProtoResponse::code`].
pub mod code {
    pub const SUCCESS: i32 = 200;
    pub const PARAM_ERROR: i32 = 400;
    pub const FORBIDDEN: i32 = 403;
    pub const SERVER_ERROR: i32 = 500;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("unknown message type {0}")]
    UnknownType(i32),
}

impl From<prost::DecodeError> for WireError {
    fn from(err: prost::DecodeError) -> Self {
        WireError::Decode(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
    Unknown = 0,
    C2cSend = 1,
    C2cAck = 2,
    C2cMsgPush = 3,
    WithdrawMsgSend = 4,
    MsgWithdrawNotification = 5,
    WithdrawMsgResponse = 6,
    GroupSend = 7,
    GroupMsgPush = 8,
    GetBatchMsgIds = 9,
    PushBatchMsgIds = 10,
    FriendRequest = 11,
    FriendResponse = 12,
    Heartbeat = 13,
    Close = 14,
}

impl MsgType {
    pub fn label(&self) -> &'static str {
        match self {
            MsgType::Unknown => "unknown",
            MsgType::C2cSend => "c2c_send",
            MsgType::C2cAck => "c2c_ack",
            MsgType::C2cMsgPush => "c2c_msg_push",
            MsgType::WithdrawMsgSend => "withdraw_msg_send",
            MsgType::MsgWithdrawNotification => "msg_withdraw_notification",
            MsgType::WithdrawMsgResponse => "withdraw_msg_response",
            MsgType::GroupSend => "group_send",
            MsgType::GroupMsgPush => "group_msg_push",
            MsgType::GetBatchMsgIds => "get_batch_msg_ids",
            MsgType::PushBatchMsgIds => "push_batch_msg_ids",
            MsgType::FriendRequest => "friend_request",
            MsgType::FriendResponse => "friend_response",
            MsgType::Heartbeat => "heartbeat",
            MsgType::Close => "close",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AckStatus {
    Unspecified = 0,
    /// The server accepted the message.
    ServerReceived = 1,
    /// Stored for an offline recipient, not yet delivered.
    OfflineUnread = 2,
    /// Delivered to the recipient, not yet read.
    Unread = 3,
    Read = 4,
}

/// Client → server envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ImProtoRequest {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub msg_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl ImProtoRequest {
    pub fn new(kind: MsgType, payload: &impl Message) -> Self {
        Self {
            msg_type: kind as i32,
            payload: payload.encode_to_vec(),
        }
    }

    /// Decode an envelope and reject unknown message types.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, WireError> {
        let request = Self::decode(frame)?;
        request.kind()?;
        Ok(request)
    }

    pub fn kind(&self) -> Result<MsgType, WireError> {
        match MsgType::try_from(self.msg_type) {
            Ok(MsgType::Unknown) | Err(_) => Err(WireError::UnknownType(self.msg_type)),
            Ok(kind) => Ok(kind),
        }
    }

    pub fn payload_as<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.payload.as_slice())?)
    }
}

/// Server → client envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ImProtoResponse {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub msg_type: i32,
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub msg: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

impl ImProtoResponse {
    pub fn success(kind: MsgType, payload: Vec<u8>) -> Self {
        Self {
            msg_type: kind as i32,
            code: code::SUCCESS,
            msg: String::new(),
            payload,
        }
    }

    pub fn with_payload(kind: MsgType, payload: &impl Message) -> Self {
        Self::success(kind, payload.encode_to_vec())
    }

    pub fn error(kind: MsgType, code: i32, msg: impl Into<String>) -> Self {
        Self {
            msg_type: kind as i32,
            code,
            msg: msg.into(),
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> MsgType {
        MsgType::try_from(self.msg_type).unwrap_or(MsgType::Unknown)
    }

    pub fn payload_as<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.payload.as_slice())?)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct C2cSendReq {
    /// Pre-allocated server id; zero asks the server to assign one.
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub to: String,
    #[prost(int32, tag = "5")]
    pub format: i32,
    #[prost(string, tag = "6")]
    pub content: String,
    #[prost(uint64, tag = "7")]
    pub time: u64,
    #[prost(string, tag = "8")]
    pub chat_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct C2cMsgPush {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub to: String,
    #[prost(int32, tag = "5")]
    pub format: i32,
    #[prost(string, tag = "6")]
    pub content: String,
    #[prost(uint64, tag = "7")]
    pub time: u64,
    #[prost(string, tag = "8")]
    pub chat_id: String,
    #[prost(uint32, tag = "9")]
    pub retry_count: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct C2cAckReq {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    /// User sending the ack (the message recipient).
    #[prost(string, tag = "3")]
    pub from: String,
    /// Original sender, who is told about the ack.
    #[prost(string, tag = "4")]
    pub to: String,
    #[prost(enumeration = "AckStatus", tag = "5")]
    pub status: i32,
    #[prost(string, tag = "6")]
    pub chat_id: String,
    #[prost(uint64, tag = "7")]
    pub time: u64,
}

impl C2cAckReq {
    pub fn ack_status(&self) -> Option<AckStatus> {
        match AckStatus::try_from(self.status) {
            Ok(AckStatus::Unspecified) | Err(_) => None,
            Ok(status) => Some(status),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct WithdrawMsgReq {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub to: String,
    #[prost(string, tag = "5")]
    pub chat_id: String,
    /// Creation time of the message being withdrawn, epoch millis.
    #[prost(uint64, tag = "6")]
    pub msg_time: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct WithdrawNotification {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub to: String,
    #[prost(string, tag = "5")]
    pub chat_id: String,
    #[prost(uint64, tag = "6")]
    pub time: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct WithdrawResponse {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(bool, tag = "3")]
    pub success: bool,
    #[prost(string, tag = "4")]
    pub reason: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupSendReq {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub group_id: String,
    #[prost(int32, tag = "5")]
    pub format: i32,
    #[prost(string, tag = "6")]
    pub content: String,
    #[prost(uint64, tag = "7")]
    pub time: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupMsgPush {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
    #[prost(string, tag = "3")]
    pub from: String,
    #[prost(string, tag = "4")]
    pub group_id: String,
    #[prost(int32, tag = "5")]
    pub format: i32,
    #[prost(string, tag = "6")]
    pub content: String,
    #[prost(uint64, tag = "7")]
    pub time: u64,
    #[prost(string, tag = "8")]
    pub chat_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupSendAck {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
    #[prost(string, tag = "2")]
    pub client_msg_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatchMsgIdsReq {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatchMsgIdsResp {
    #[prost(uint64, repeated, tag = "1")]
    pub msg_ids: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FriendRequestNotice {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub from: String,
    #[prost(string, tag = "3")]
    pub to: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(uint64, tag = "5")]
    pub time: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct FriendResponseNotice {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub from: String,
    #[prost(string, tag = "3")]
    pub to: String,
    #[prost(bool, tag = "4")]
    pub accepted: bool,
    #[prost(uint64, tag = "5")]
    pub time: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CloseNotice {
    #[prost(string, tag = "1")]
    pub reason: String,
}
