//! One actor per client socket.
//!
//! The reader half runs [`ConnectionActor::read_loop`] and dispatches decoded frames to the
//! relay router and lifecycle controller. The writer half ([`pump_outbound`]) owns the socket
//! sink and drains a bounded queue fed through [`ConnectionHandle`]; every write is bounded by
//! the configured write timeout so a stalled client only ever stalls itself.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::lifecycle::{Actor, LifecycleError};
use crate::relay::RouteError;
use crate::signaling::{
    self, ClientMessage, DecodeError, RejectReason, ServerMessage, SignalKind, SignalMessage,
};
use crate::state::RelayState;

pub type ConnectionId = Uuid;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    SessionEnded,
    Superseded,
    WriteStalled,
    Abusive,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Left => "left",
            CloseReason::SessionEnded => "session-ended",
            CloseReason::Superseded => "superseded",
            CloseReason::WriteStalled => "write-stalled",
            CloseReason::Abusive => "abusive",
            CloseReason::ServerShutdown => "server-shutdown",
        }
    }

    /// RFC 6455 close code.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Left | CloseReason::SessionEnded | CloseReason::Superseded => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::WriteStalled | CloseReason::Abusive => 1008,
        }
    }

    fn frame(self) -> Message {
        Message::Close(Some(CloseFrame {
            code: self.code(),
            reason: self.as_str().into(),
        }))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Backpressure,
    #[error("connection is closed")]
    Closed,
}

/// Cloneable address of a connection. The registry stores these; all cross-actor delivery
/// goes through [`ConnectionHandle::send`], which never blocks.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn channel(buffer: usize) -> (Self, OutboundReceiver) {
        Self::with_shutdown(buffer, CancellationToken::new())
    }

    /// Ties the connection to a parent token so server shutdown cancels it.
    pub fn child_of(parent: &CancellationToken, buffer: usize) -> (Self, OutboundReceiver) {
        Self::with_shutdown(buffer, parent.child_token())
    }

    fn with_shutdown(buffer: usize, shutdown: CancellationToken) -> (Self, OutboundReceiver) {
        let (outbound, receiver) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            outbound,
            shutdown,
            close_reason: Arc::new(Mutex::new(None)),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: ServerMessage) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound
            .try_send(Outbound::Message(message))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queues a close frame behind anything already queued and cancels the connection. Only
    /// the first reason sticks; returns false if the connection was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        let _ = self.outbound.try_send(Outbound::Close(reason));
        self.shutdown.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Timeouts for the writer half.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub write_timeout: Duration,
    pub flush_timeout: Duration,
}

impl From<&RelayConfig> for WriterSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            write_timeout: config.write_timeout,
            flush_timeout: config.flush_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    Closed(CloseReason),
    Stalled,
    SocketError,
}

async fn write_frame<S>(sink: &mut S, message: &ServerMessage, limit: Duration) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let text = match signaling::encode(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "dropping unencodable server frame");
            return Ok(());
        }
    };
    match tokio::time::timeout(limit, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "socket write failed");
            Err(())
        }
        Err(_) => Err(()),
    }
}

/// Drains the outbound queue into `sink` until the connection closes.
pub async fn pump_outbound<S>(
    mut sink: S,
    mut outbound: OutboundReceiver,
    handle: ConnectionHandle,
    settings: WriterSettings,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let shutdown = handle.shutdown_token();
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(Outbound::Message(message)) => {
                    if write_frame(&mut sink, &message, settings.write_timeout).await.is_err() {
                        warn!(connection_id = %handle.id(), "socket write stalled; dropping connection");
                        counter!("live_relay_write_stalls_total", 1);
                        handle.close(CloseReason::WriteStalled);
                        return WriterExit::Stalled;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let _ = tokio::time::timeout(settings.flush_timeout, sink.send(reason.frame())).await;
                    return WriterExit::Closed(reason);
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Cancelled without a queued close frame: flush what is left, bounded.
    let reason = handle.close_reason().unwrap_or(CloseReason::ServerShutdown);
    let flush = async {
        while let Ok(item) = outbound.try_recv() {
            match item {
                Outbound::Message(message) => {
                    if write_frame(&mut sink, &message, settings.write_timeout).await.is_err() {
                        return WriterExit::SocketError;
                    }
                }
                Outbound::Close(_) => break,
            }
        }
        let _ = sink.send(reason.frame()).await;
        WriterExit::Closed(reason)
    };
    match tokio::time::timeout(settings.flush_timeout, flush).await {
        Ok(exit) => exit,
        Err(_) => {
            debug!(connection_id = %handle.id(), "flush timed out; force closing");
            WriterExit::Closed(reason)
        }
    }
}

/// Sliding window over recent decode failures.
#[derive(Debug)]
pub struct DecodeFailureWindow {
    limit: usize,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl DecodeFailureWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            failures: VecDeque::new(),
        }
    }

    /// Records a failure; true once `limit` failures fall inside the window.
    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        self.failures.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Connecting,
    Joined,
    Leaving,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorExit {
    ClientLeft,
    Dropped,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(ActorExit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    room_id: String,
    user_id: String,
}

pub struct ConnectionActor {
    state: RelayState,
    handle: ConnectionHandle,
    phase: ActorState,
    identity: Option<Identity>,
    decode_failures: DecodeFailureWindow,
}

impl ConnectionActor {
    pub fn new(state: RelayState, handle: ConnectionHandle) -> Self {
        let decode_failures = DecodeFailureWindow::new(
            state.config.decode_failure_limit,
            state.config.decode_failure_window,
        );
        Self {
            state,
            handle,
            phase: ActorState::Connecting,
            identity: None,
            decode_failures,
        }
    }

    pub fn phase(&self) -> ActorState {
        self.phase
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn joined_as(&self) -> Option<(&str, &str)> {
        self.identity
            .as_ref()
            .map(|identity| (identity.room_id.as_str(), identity.user_id.as_str()))
    }

    fn reject(&self, reason: RejectReason, message: impl Into<String>) {
        let message = message.into();
        debug!(
            connection_id = %self.handle.id(),
            reason = reason.as_str(),
            %message,
            "rejecting client action"
        );
        counter!("live_relay_rejections_total", 1, "reason" => reason.as_str());
        let _ = self.handle.send(ServerMessage::rejected(reason, message));
    }

    fn reject_lifecycle(&self, err: &LifecycleError) {
        let _ = self.handle.send(ServerMessage::Rejected {
            reason: err.reason(),
            message: err.to_string(),
            retry_after_secs: err.retry_after_secs(),
        });
        counter!("live_relay_rejections_total", 1, "reason" => err.reason().as_str());
    }

    /// The joined identity, if `room_id`/`user_id` match it.
    fn identity_for(&self, room_id: &str, user_id: &str) -> Option<&Identity> {
        self.identity
            .as_ref()
            .filter(|identity| identity.room_id == room_id && identity.user_id == user_id)
    }

    fn require_identity(&self, room_id: &str, user_id: &str) -> Option<Identity> {
        match self.identity_for(room_id, user_id) {
            Some(identity) if self.phase == ActorState::Joined => Some(identity.clone()),
            _ => {
                self.reject(
                    RejectReason::NotJoined,
                    format!("connection has not joined room {room_id} as {user_id}"),
                );
                None
            }
        }
    }

    fn decode_failed(&mut self, label: &'static str, detail: &dyn fmt::Display) -> Flow {
        counter!("live_relay_decode_failures_total", 1, "reason" => label);
        warn!(connection_id = %self.handle.id(), error = %detail, "dropping malformed frame");
        if self.decode_failures.record() {
            warn!(
                connection_id = %self.handle.id(),
                failures = self.decode_failures.len(),
                "decode failure threshold exceeded; closing connection"
            );
            return Flow::Stop(ActorExit::Closed(CloseReason::Abusive));
        }
        Flow::Continue
    }

    pub async fn handle_text(&mut self, raw: &str) -> Flow {
        if matches!(self.phase, ActorState::Leaving | ActorState::Closed) {
            return Flow::Continue;
        }
        match signaling::decode(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => {
                let label = DecodeError::metric_label(&err);
                self.decode_failed(label, &err)
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Flow {
        debug!(
            connection_id = %self.handle.id(),
            kind = message.type_name(),
            room_id = message.room_id().unwrap_or_default(),
            "client frame"
        );
        match message {
            ClientMessage::JoinRoom {
                room_id,
                user_id,
                user_name,
            } => self.on_join(room_id, user_id, user_name).await,
            ClientMessage::Offer {
                room_id,
                to,
                from_user_id,
                payload,
            } => self.on_direct(SignalKind::Offer, room_id, from_user_id, to, payload),
            ClientMessage::Answer {
                room_id,
                to,
                from_user_id,
                payload,
            } => self.on_direct(SignalKind::Answer, room_id, from_user_id, to, payload),
            ClientMessage::IceCandidate {
                room_id,
                to,
                from_user_id,
                payload,
            } => self.on_direct(SignalKind::IceCandidate, room_id, from_user_id, to, payload),
            ClientMessage::ChatMessage {
                room_id,
                user_id,
                user_name,
                message,
            } => {
                if self.require_identity(&room_id, &user_id).is_some() {
                    let signal = SignalMessage::chat(room_id, user_id, user_name, message);
                    if let Err(err) = self.state.router.route(signal) {
                        self.route_failed(err);
                    }
                }
                Flow::Continue
            }
            ClientMessage::LeaveRoom { room_id, user_id } => {
                if self.require_identity(&room_id, &user_id).is_some() {
                    return Flow::Stop(ActorExit::ClientLeft);
                }
                Flow::Continue
            }
            ClientMessage::StartSession { room_id, admin_id } => {
                if let Some(identity) = self.require_identity(&room_id, &admin_id) {
                    if let Err(err) = self
                        .state
                        .lifecycle
                        .start(&identity.room_id, &Actor::Member(identity.user_id))
                    {
                        self.reject_lifecycle(&err);
                    }
                }
                Flow::Continue
            }
            ClientMessage::EndSession { room_id, admin_id } => {
                if let Some(identity) = self.require_identity(&room_id, &admin_id) {
                    if let Err(err) = self
                        .state
                        .lifecycle
                        .end(&identity.room_id, &Actor::Member(identity.user_id))
                    {
                        self.reject_lifecycle(&err);
                    }
                }
                Flow::Continue
            }
            ClientMessage::PeerStatus {
                room_id,
                to,
                from_user_id,
                status,
            } => {
                if self.require_identity(&room_id, &from_user_id).is_some() {
                    if let Err(err) =
                        self.state
                            .router
                            .report_link(&room_id, &from_user_id, &to, status.into())
                    {
                        debug!(room_id = %room_id, user_id = %from_user_id, error = %err, "ignoring peer status");
                    }
                }
                Flow::Continue
            }
            ClientMessage::Ping => {
                let _ = self.handle.send(ServerMessage::Pong);
                Flow::Continue
            }
        }
    }

    async fn on_join(&mut self, room_id: String, user_id: String, user_name: String) -> Flow {
        if let Some(current) = &self.identity {
            if current.room_id != room_id || current.user_id != user_id {
                self.reject(
                    RejectReason::InvalidTransition,
                    format!(
                        "connection already joined room {} as {}",
                        current.room_id, current.user_id
                    ),
                );
                return Flow::Continue;
            }
        }

        match self
            .state
            .lifecycle
            .join(&room_id, &user_id, &user_name, self.handle.clone())
            .await
        {
            Ok(_) => {
                if self.phase != ActorState::Joined {
                    info!(
                        connection_id = %self.handle.id(),
                        room_id = %room_id,
                        user_id = %user_id,
                        "connection joined room"
                    );
                }
                self.phase = ActorState::Joined;
                self.identity = Some(Identity { room_id, user_id });
            }
            Err(err) => self.reject_lifecycle(&err),
        }
        Flow::Continue
    }

    fn on_direct(
        &mut self,
        kind: SignalKind,
        room_id: String,
        from_user_id: String,
        to: String,
        payload: serde_json::Value,
    ) -> Flow {
        if self.require_identity(&room_id, &from_user_id).is_none() {
            return Flow::Continue;
        }
        let signal = SignalMessage::direct(kind, room_id, from_user_id, to, payload);
        if let Err(err) = self.state.router.route(signal) {
            self.route_failed(err);
        }
        Flow::Continue
    }

    /// Unroutable targets are swallowed; pairing violations go back to the sender.
    fn route_failed(&self, err: RouteError) {
        match err.reject_reason() {
            Some(reason) => self.reject(reason, err.to_string()),
            None => debug!(connection_id = %self.handle.id(), error = %err, "signal not delivered"),
        }
    }

    /// Reads frames until the client leaves, the socket drops, or the connection is closed
    /// from elsewhere (session end, supersede, shutdown).
    pub async fn read_loop<S, E>(&mut self, mut inbound: S) -> ActorExit
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let shutdown = self.handle.shutdown_token();
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let reason = self.handle.close_reason().unwrap_or(CloseReason::ServerShutdown);
                    return ActorExit::Closed(reason);
                }
                frame = inbound.next() => frame,
            };
            let flow = match frame {
                None => return ActorExit::Dropped,
                Some(Err(err)) => {
                    debug!(connection_id = %self.handle.id(), error = %err, "socket read failed");
                    return ActorExit::Dropped;
                }
                Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_text(text).await,
                    Err(err) => self.decode_failed("invalid_utf8", &err),
                },
                Some(Ok(Message::Close(_))) => return ActorExit::Dropped,
                Some(Ok(_)) => Flow::Continue,
            };
            if let Flow::Stop(exit) = flow {
                return exit;
            }
        }
    }

    /// Leaves the room (announcing `user-disconnected` to peers) and closes the connection.
    pub fn finish(&mut self, exit: ActorExit) {
        self.phase = ActorState::Leaving;
        if let Some(identity) = self.identity.take() {
            self.state.lifecycle.leave(
                &identity.room_id,
                &identity.user_id,
                Some(self.handle.id()),
            );
        }
        let reason = match exit {
            ActorExit::ClientLeft | ActorExit::Dropped => CloseReason::Left,
            ActorExit::Closed(reason) => reason,
        };
        self.handle.close(reason);
        self.phase = ActorState::Closed;
        debug!(connection_id = %self.handle.id(), ?exit, "connection actor finished");
    }
}

/// Runs both halves of one upgraded websocket.
pub async fn serve_socket(socket: WebSocket, state: RelayState) {
    let (sink, stream) = socket.split();
    let (handle, outbound) = ConnectionHandle::child_of(&state.shutdown, state.config.outbound_buffer);
    let connection_id = handle.id();
    let writer = tokio::spawn(pump_outbound(
        sink,
        outbound,
        handle.clone(),
        WriterSettings::from(state.config.as_ref()),
    ));

    increment_gauge!("live_relay_connections_active", 1.0);
    counter!("live_relay_connections_total", 1);
    debug!(connection_id = %connection_id, "websocket connected");

    let mut actor = ConnectionActor::new(state, handle);
    let exit = actor.read_loop(stream).await;
    actor.finish(exit);

    match writer.await {
        Ok(writer_exit) => debug!(connection_id = %connection_id, ?writer_exit, "writer finished"),
        Err(err) => warn!(connection_id = %connection_id, error = %err, "writer task failed"),
    }
    decrement_gauge!("live_relay_connections_active", 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::lifecycle::ManualClock;
    use crate::store::MemorySessionStore;
    use chrono::Utc;
    use futures_util::stream;
    use std::convert::Infallible;
    use tokio_util::sync::PollSender;

    fn relay_state() -> RelayState {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        RelayState::new(
            RelayConfig::default(),
            Arc::new(MemorySessionStore::default()),
            clock,
            None,
        )
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(message) = item {
                frames.push(message);
            }
        }
        frames
    }

    #[test_timeout::timeout]
    fn close_is_sticky_and_queued_last() {
        let (handle, mut rx) = ConnectionHandle::channel(4);
        handle.send(ServerMessage::Pong).unwrap();
        assert!(handle.close(CloseReason::SessionEnded));
        assert!(!handle.close(CloseReason::Abusive));
        assert_eq!(handle.close_reason(), Some(CloseReason::SessionEnded));
        assert_eq!(handle.send(ServerMessage::Pong), Err(SendError::Closed));

        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(ServerMessage::Pong))));
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close(CloseReason::SessionEnded))
        ));
    }

    #[test_timeout::timeout]
    fn full_queue_reports_backpressure() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        handle.send(ServerMessage::Pong).unwrap();
        assert_eq!(handle.send(ServerMessage::Pong), Err(SendError::Backpressure));
    }

    #[test_timeout::timeout]
    fn decode_window_trips_at_limit_and_slides() {
        let mut window = DecodeFailureWindow::new(3, Duration::from_secs(10));
        let start = Instant::now();
        assert!(!window.record_at(start));
        assert!(!window.record_at(start + Duration::from_secs(1)));
        // the first failure has aged out by now
        assert!(!window.record_at(start + Duration::from_secs(11)));
        assert!(window.record_at(start + Duration::from_secs(12)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frames_are_dropped_until_threshold() {
        let state = relay_state();
        let (handle, mut rx) = ConnectionHandle::channel(64);
        let mut actor = ConnectionActor::new(state.clone(), handle);

        let limit = state.config.decode_failure_limit;
        for _ in 0..limit - 1 {
            assert_eq!(actor.handle_text("{not json").await, Flow::Continue);
        }
        assert!(drain(&mut rx).is_empty(), "malformed frames get no reply");
        assert_eq!(
            actor.handle_text(r#"{"type":"warp"}"#).await,
            Flow::Stop(ActorExit::Closed(CloseReason::Abusive))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_acks_and_unjoined_signals_are_rejected() {
        let state = relay_state();
        let (handle, mut rx) = ConnectionHandle::channel(64);
        let mut actor = ConnectionActor::new(state.clone(), handle);

        let offer = r#"{"type":"offer","roomId":"r1","to":"u1","fromUserId":"u2","payload":{}}"#;
        actor.handle_text(offer).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Rejected {
                reason: RejectReason::NotJoined,
                ..
            }]
        ));

        actor
            .handle_text(r#"{"type":"join-room","roomId":"r1","userId":"u2","userName":"Bo"}"#)
            .await;
        assert_eq!(actor.phase(), ActorState::Joined);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Joined { .. }]
        ));

        // identity on the frame must match the joined identity
        actor
            .handle_text(r#"{"type":"chat-message","roomId":"r1","userId":"u9","userName":"Nine","message":"hi"}"#)
            .await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Rejected {
                reason: RejectReason::NotJoined,
                ..
            }]
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn read_loop_stops_on_leave_and_finish_closes() {
        let state = relay_state();
        let (handle, _rx) = ConnectionHandle::channel(64);
        let mut actor = ConnectionActor::new(state.clone(), handle.clone());
        let frames = vec![
            Ok::<_, Infallible>(Message::Text(
                r#"{"type":"join-room","roomId":"r1","userId":"u1","userName":"Ada"}"#.into(),
            )),
            Ok(Message::Text(r#"{"type":"leave-room","roomId":"r1","userId":"u1"}"#.into())),
            Ok(Message::Text(r#"{"type":"ping"}"#.into())),
        ];
        let exit = actor.read_loop(stream::iter(frames)).await;
        assert_eq!(exit, ActorExit::ClientLeft);

        actor.finish(exit);
        assert_eq!(actor.phase(), ActorState::Closed);
        assert_eq!(handle.close_reason(), Some(CloseReason::Left));
        assert!(state.registry.snapshot("r1").unwrap().members.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn read_loop_exits_when_closed_elsewhere() {
        let state = relay_state();
        let (handle, _rx) = ConnectionHandle::channel(8);
        let mut actor = ConnectionActor::new(state, handle.clone());
        handle.close(CloseReason::Superseded);
        let exit = actor
            .read_loop(stream::pending::<Result<Message, Infallible>>())
            .await;
        assert_eq!(exit, ActorExit::Closed(CloseReason::Superseded));
    }

    #[test_timeout::tokio_timeout_test]
    async fn writer_flushes_then_sends_close_frame() {
        let (handle, rx) = ConnectionHandle::channel(8);
        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(8);
        handle.send(ServerMessage::Pong).unwrap();
        handle.close(CloseReason::SessionEnded);

        let exit = pump_outbound(
            PollSender::new(socket_tx),
            rx,
            handle,
            WriterSettings {
                write_timeout: Duration::from_secs(1),
                flush_timeout: Duration::from_secs(1),
            },
        )
        .await;
        assert_eq!(exit, WriterExit::Closed(CloseReason::SessionEnded));
        assert!(matches!(socket_rx.recv().await, Some(Message::Text(text)) if text.contains("pong")));
        match socket_rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason, "session-ended");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn stalled_socket_is_closed_after_write_timeout() {
        let (handle, rx) = ConnectionHandle::channel(8);
        // capacity one and never read: the second write blocks forever
        let (socket_tx, _socket_rx) = mpsc::channel::<Message>(1);
        handle.send(ServerMessage::Pong).unwrap();
        handle.send(ServerMessage::Pong).unwrap();

        let exit = pump_outbound(
            PollSender::new(socket_tx),
            rx,
            handle.clone(),
            WriterSettings {
                write_timeout: Duration::from_secs(5),
                flush_timeout: Duration::from_secs(2),
            },
        )
        .await;
        assert_eq!(exit, WriterExit::Stalled);
        assert_eq!(handle.close_reason(), Some(CloseReason::WriteStalled));
    }
}
