//! Wire protocol spoken between browsers and the relay.
//!
//! Frames are JSON objects tagged by `type`. Client frames are decoded leniently into a
//! [`RawFrame`] first so that missing routing fields surface as [`DecodeError::MissingField`]
//! instead of an opaque serde message. Payloads (SDP, ICE candidates, chat text) are carried as
//! [`serde_json::Value`] and never inspected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::pairing::LinkPhase;
use crate::registry::{MemberRole, RoomStatus};

/// Kinds of signaling envelopes the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Join,
    Offer,
    Answer,
    IceCandidate,
    Chat,
    Leave,
    End,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Chat => "chat",
            SignalKind::Leave => "leave",
            SignalKind::End => "end",
        }
    }

    /// Broadcast kinds have no addressed target.
    pub fn is_broadcast(self) -> bool {
        matches!(self, SignalKind::Join | SignalKind::Chat | SignalKind::End)
    }
}

/// Immutable routing envelope handed to the relay router.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub room_id: String,
    pub from_user_id: String,
    pub from_user_name: Option<String>,
    pub to_user_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalMessage {
    pub fn direct(
        kind: SignalKind,
        room_id: impl Into<String>,
        from_user_id: impl Into<String>,
        to_user_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            from_user_id: from_user_id.into(),
            from_user_name: None,
            to_user_id: Some(to_user_id.into()),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn chat(
        room_id: impl Into<String>,
        from_user_id: impl Into<String>,
        from_user_name: impl Into<String>,
        message: Value,
    ) -> Self {
        Self {
            kind: SignalKind::Chat,
            room_id: room_id.into(),
            from_user_id: from_user_id.into(),
            from_user_name: Some(from_user_name.into()),
            to_user_id: None,
            payload: message,
            timestamp: Utc::now(),
        }
    }
}

/// Peer-reported connection outcome for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerReport {
    Connected,
    Failed,
}

impl From<PeerReport> for LinkPhase {
    fn from(report: PeerReport) -> Self {
        match report {
            PeerReport::Connected => LinkPhase::Connected,
            PeerReport::Failed => LinkPhase::Failed,
        }
    }
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
    },
    Offer {
        room_id: String,
        to: String,
        from_user_id: String,
        payload: Value,
    },
    Answer {
        room_id: String,
        to: String,
        from_user_id: String,
        payload: Value,
    },
    IceCandidate {
        room_id: String,
        to: String,
        from_user_id: String,
        payload: Value,
    },
    ChatMessage {
        room_id: String,
        user_id: String,
        user_name: String,
        message: Value,
    },
    LeaveRoom {
        room_id: String,
        user_id: String,
    },
    StartSession {
        room_id: String,
        admin_id: String,
    },
    EndSession {
        room_id: String,
        admin_id: String,
    },
    PeerStatus {
        room_id: String,
        to: String,
        from_user_id: String,
        status: PeerReport,
    },
    Ping,
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::StartSession { .. } => "start-session",
            ClientMessage::EndSession { .. } => "end-session",
            ClientMessage::PeerStatus { .. } => "peer-status",
            ClientMessage::Ping => "ping",
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::Offer { room_id, .. }
            | ClientMessage::Answer { room_id, .. }
            | ClientMessage::IceCandidate { room_id, .. }
            | ClientMessage::ChatMessage { room_id, .. }
            | ClientMessage::LeaveRoom { room_id, .. }
            | ClientMessage::StartSession { room_id, .. }
            | ClientMessage::EndSession { room_id, .. }
            | ClientMessage::PeerStatus { room_id, .. } => Some(room_id),
            ClientMessage::Ping => None,
        }
    }
}

/// Machine-readable reason attached to every rejected action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    RoomEnded,
    TooEarly,
    NotHost,
    InvalidTransition,
    NotInitiator,
    NoPendingOffer,
    NotJoined,
    RoomNotFound,
    AlreadyExists,
    StoreUnavailable,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::RoomEnded => "room-ended",
            RejectReason::TooEarly => "too-early",
            RejectReason::NotHost => "not-host",
            RejectReason::InvalidTransition => "invalid-transition",
            RejectReason::NotInitiator => "not-initiator",
            RejectReason::NoPendingOffer => "no-pending-offer",
            RejectReason::NotJoined => "not-joined",
            RejectReason::RoomNotFound => "room-not-found",
            RejectReason::AlreadyExists => "already-exists",
            RejectReason::StoreUnavailable => "store-unavailable",
        }
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges a successful `join-room` to the joiner only.
    Joined {
        room_id: String,
        user_id: String,
        role: MemberRole,
        status: RoomStatus,
    },
    UserConnected {
        user_id: String,
        user_name: String,
        socket_id: String,
        /// Whether the receiver must send the offer for this pair.
        initiator: bool,
    },
    UserDisconnected {
        user_id: String,
    },
    Offer {
        room_id: String,
        from_user_id: String,
        payload: Value,
    },
    Answer {
        room_id: String,
        from_user_id: String,
        payload: Value,
    },
    IceCandidate {
        room_id: String,
        from_user_id: String,
        payload: Value,
    },
    ChatMessage {
        room_id: String,
        user_id: String,
        user_name: String,
        message: Value,
        timestamp: DateTime<Utc>,
    },
    SessionStarted {
        room_id: String,
        started_at: DateTime<Utc>,
    },
    EndSession {
        room_id: String,
        admin_id: Option<String>,
        ended_at: DateTime<Utc>,
    },
    Rejected {
        reason: RejectReason,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        ServerMessage::Rejected {
            reason,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no type")]
    MissingType,
    #[error("unrecognized message type {0:?}")]
    UnknownType(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid value for field {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

impl DecodeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::MissingType => "missing_type",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::InvalidField { .. } => "invalid_field",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    room_id: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
    to: Option<String>,
    from_user_id: Option<String>,
    admin_id: Option<String>,
    payload: Option<Value>,
    message: Option<Value>,
    status: Option<Value>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DecodeError::MissingField(field)),
    }
}

fn required_value(value: Option<Value>, field: &'static str) -> Result<Value, DecodeError> {
    match value {
        Some(Value::Null) | None => Err(DecodeError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

/// Decodes one client frame. Never has side effects.
pub fn decode(raw: &str) -> Result<ClientMessage, DecodeError> {
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let kind = frame.kind.ok_or(DecodeError::MissingType)?;

    let message = match kind.as_str() {
        "join-room" => ClientMessage::JoinRoom {
            room_id: required(frame.room_id, "roomId")?,
            user_id: required(frame.user_id, "userId")?,
            user_name: required(frame.user_name, "userName")?,
        },
        "offer" | "answer" | "ice-candidate" => {
            let room_id = required(frame.room_id, "roomId")?;
            let from_user_id = required(frame.from_user_id, "fromUserId")?;
            let to = required(frame.to, "to")?;
            let payload = required_value(frame.payload, "payload")?;
            match kind.as_str() {
                "offer" => ClientMessage::Offer {
                    room_id,
                    to,
                    from_user_id,
                    payload,
                },
                "answer" => ClientMessage::Answer {
                    room_id,
                    to,
                    from_user_id,
                    payload,
                },
                _ => ClientMessage::IceCandidate {
                    room_id,
                    to,
                    from_user_id,
                    payload,
                },
            }
        }
        "chat-message" => ClientMessage::ChatMessage {
            room_id: required(frame.room_id, "roomId")?,
            user_id: required(frame.user_id, "userId")?,
            user_name: required(frame.user_name, "userName")?,
            message: required_value(frame.message, "message")?,
        },
        "leave-room" => ClientMessage::LeaveRoom {
            room_id: required(frame.room_id, "roomId")?,
            user_id: required(frame.user_id, "userId")?,
        },
        "start-session" => ClientMessage::StartSession {
            room_id: required(frame.room_id, "roomId")?,
            admin_id: required(frame.admin_id, "adminId")?,
        },
        "end-session" => ClientMessage::EndSession {
            room_id: required(frame.room_id, "roomId")?,
            admin_id: required(frame.admin_id, "adminId")?,
        },
        "peer-status" => {
            let status = required_value(frame.status, "status")?;
            let status: PeerReport =
                serde_json::from_value(status).map_err(|err| DecodeError::InvalidField {
                    field: "status",
                    detail: err.to_string(),
                })?;
            ClientMessage::PeerStatus {
                room_id: required(frame.room_id, "roomId")?,
                to: required(frame.to, "to")?,
                from_user_id: required(frame.from_user_id, "fromUserId")?,
                status,
            }
        }
        "ping" => ClientMessage::Ping,
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };

    Ok(message)
}

/// Encodes a server frame as JSON text.
pub fn encode(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
