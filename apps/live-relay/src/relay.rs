use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{CloseReason, ConnectionHandle, SendError};
use crate::pairing::{LinkPhase, PairingError};
use crate::registry::{Member, RegistryError, RoomRegistry};
use crate::signaling::{RejectReason, ServerMessage, SignalKind, SignalMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("target {user_id} is not in room {room_id}")]
    TargetNotFound { room_id: String, user_id: String },
    #[error("sender {user_id} is not in room {room_id}")]
    SenderNotMember { room_id: String, user_id: String },
    #[error("{0:?} requires a target")]
    MissingTarget(SignalKind),
    #[error("{0:?} is not routed by the relay")]
    NotRoutable(SignalKind),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Registry(RegistryError),
}

impl RouteError {
    fn from_registry(err: RegistryError, sender: &str) -> Self {
        match err {
            RegistryError::RoomNotFound(room_id) | RegistryError::RoomEnded(room_id) => {
                RouteError::RoomNotFound(room_id)
            }
            RegistryError::MemberNotFound { room_id, user_id } if user_id == sender => {
                RouteError::SenderNotMember { room_id, user_id }
            }
            RegistryError::MemberNotFound { room_id, user_id } => {
                RouteError::TargetNotFound { room_id, user_id }
            }
            RegistryError::Pairing(err) => RouteError::Pairing(err),
            other => RouteError::Registry(other),
        }
    }

    /// Reason code for the sender, or `None` when the failure is swallowed.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            RouteError::SenderNotMember { .. } => Some(RejectReason::NotJoined),
            RouteError::Pairing(PairingError::NotInitiator { .. }) => {
                Some(RejectReason::NotInitiator)
            }
            RouteError::Pairing(PairingError::NoPendingOffer { .. }) => {
                Some(RejectReason::NoPendingOffer)
            }
            _ => None,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::RoomNotFound(_) => "room_not_found",
            RouteError::TargetNotFound { .. } => "target_not_found",
            RouteError::SenderNotMember { .. } => "sender_not_member",
            RouteError::MissingTarget(_) => "missing_target",
            RouteError::NotRoutable(_) => "not_routable",
            RouteError::Pairing(_) => "pairing",
            RouteError::Registry(_) => "registry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    /// Link phase after a point-to-point signal.
    pub phase: Option<LinkPhase>,
}

/// Forwards signaling frames between members of a room. Delivery only enqueues on the
/// target's bounded outbound queue; it never waits on a socket.
#[derive(Clone)]
pub struct RelayRouter {
    registry: RoomRegistry,
}

impl RelayRouter {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    pub fn route(&self, message: SignalMessage) -> Result<RouteOutcome, RouteError> {
        let kind = message.kind;
        let result = match kind {
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
                self.route_direct(message)
            }
            SignalKind::Chat => self.route_chat(message),
            SignalKind::Join | SignalKind::Leave | SignalKind::End => {
                Err(RouteError::NotRoutable(kind))
            }
        };
        match &result {
            Ok(outcome) => {
                counter!("live_relay_messages_routed_total", outcome.delivered as u64, "kind" => kind.as_str());
            }
            Err(err) => {
                counter!("live_relay_route_failures_total", 1, "reason" => err.metric_label());
            }
        }
        result
    }

    fn route_direct(&self, message: SignalMessage) -> Result<RouteOutcome, RouteError> {
        let SignalMessage {
            kind,
            room_id,
            from_user_id,
            to_user_id,
            payload,
            ..
        } = message;
        let to = to_user_id.ok_or(RouteError::MissingTarget(kind))?;
        let (target, phase) = self
            .registry
            .record_signal(&room_id, &from_user_id, &to, kind)
            .map_err(|err| RouteError::from_registry(err, &from_user_id))?;

        let frame = match kind {
            SignalKind::Offer => ServerMessage::Offer {
                room_id,
                from_user_id,
                payload,
            },
            SignalKind::Answer => ServerMessage::Answer {
                room_id,
                from_user_id,
                payload,
            },
            _ => ServerMessage::IceCandidate {
                room_id,
                from_user_id,
                payload,
            },
        };
        let delivered = usize::from(self.send_to(&target, frame));
        Ok(RouteOutcome {
            delivered,
            phase: Some(phase),
        })
    }

    fn route_chat(&self, message: SignalMessage) -> Result<RouteOutcome, RouteError> {
        let members = self
            .registry
            .members(&message.room_id)
            .map_err(|err| RouteError::from_registry(err, &message.from_user_id))?;
        if !members.iter().any(|m| m.user_id == message.from_user_id) {
            return Err(RouteError::SenderNotMember {
                room_id: message.room_id,
                user_id: message.from_user_id,
            });
        }
        let frame = ServerMessage::ChatMessage {
            room_id: message.room_id,
            user_id: message.from_user_id.clone(),
            user_name: message.from_user_name.unwrap_or_default(),
            message: message.payload,
            timestamp: message.timestamp,
        };
        let delivered = self.fan_out(&members, Some(&message.from_user_id), &frame);
        Ok(RouteOutcome {
            delivered,
            phase: None,
        })
    }

    /// Sends `message` to every member of the room except `except`.
    pub fn broadcast(
        &self,
        room_id: &str,
        except: Option<&str>,
        message: &ServerMessage,
    ) -> Result<usize, RouteError> {
        let members = self
            .registry
            .members(room_id)
            .map_err(|err| RouteError::from_registry(err, ""))?;
        Ok(self.fan_out(&members, except, message))
    }

    pub fn fan_out(&self, members: &[Member], except: Option<&str>, message: &ServerMessage) -> usize {
        members
            .iter()
            .filter(|member| Some(member.user_id.as_str()) != except)
            .filter(|member| self.send_to(&member.connection, message.clone()))
            .count()
    }

    /// Enqueues one frame. A full queue means the client is not keeping up; it is dropped
    /// rather than allowed to hold up the room.
    pub fn send_to(&self, target: &ConnectionHandle, message: ServerMessage) -> bool {
        match target.send(message) {
            Ok(()) => true,
            Err(SendError::Backpressure) => {
                warn!(connection_id = %target.id(), "outbound queue full; closing slow connection");
                counter!("live_relay_backpressure_closes_total", 1);
                target.close(CloseReason::WriteStalled);
                false
            }
            Err(SendError::Closed) => {
                debug!(connection_id = %target.id(), "skipping closed connection");
                false
            }
        }
    }

    pub fn report_link(
        &self,
        room_id: &str,
        from: &str,
        to: &str,
        phase: LinkPhase,
    ) -> Result<LinkPhase, RouteError> {
        self.registry
            .report_link(room_id, from, to, phase)
            .map_err(|err| RouteError::from_registry(err, from))
    }
}
