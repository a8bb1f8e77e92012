//! Room-level session lifecycle: scheduled, live, ended.
//!
//! The controller is the only place that changes room status. It mirrors sessions from the
//! [`SessionStore`](crate::store::SessionStore) lazily, announces membership changes, and
//! reconciles start and end back to the store in background tasks so that participants are
//! never held up by storage I/O.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{CloseReason, ConnectionHandle, ConnectionId};
use crate::pairing::should_initiate;
use crate::registry::{
    Admission, Member, RegistryError, RoomRegistry, RoomSeed, RoomSnapshot, RoomStatus,
};
use crate::relay::RelayRouter;
use crate::signaling::{RejectReason, ServerMessage};
use crate::store::{SessionRecord, SharedSessionStore, StoreError};

/// How often a join re-mirrors a room the sweeper evicted underneath it.
const ADMISSION_ATTEMPTS: u32 = 3;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Who is asking for a lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Upstream operator surface; bypasses the host check.
    Admin,
    Member(String),
}

impl Actor {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::Admin => None,
            Actor::Member(user_id) => Some(user_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("room {0} has ended")]
    RoomEnded(String),
    #[error("room {room_id} starts in {}s", .remaining.as_secs())]
    TooEarly {
        room_id: String,
        remaining: Duration,
    },
    #[error("{user_id} is not the host of room {room_id}")]
    NotHost { room_id: String, user_id: String },
    #[error("room {room_id} cannot move from {from} to {to}")]
    InvalidTransition {
        room_id: String,
        from: RoomStatus,
        to: RoomStatus,
    },
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("room {0} already exists")]
    AlreadyExists(String),
    #[error("session store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(RegistryError),
}

impl LifecycleError {
    fn from_registry(err: RegistryError) -> Self {
        match err {
            RegistryError::RoomNotFound(room_id) => LifecycleError::RoomNotFound(room_id),
            RegistryError::RoomEnded(room_id) => LifecycleError::RoomEnded(room_id),
            other => LifecycleError::Registry(other),
        }
    }

    fn transition(room_id: &str, err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidTransition { from, to } => LifecycleError::InvalidTransition {
                room_id: room_id.to_string(),
                from,
                to,
            },
            other => Self::from_registry(other),
        }
    }

    pub fn reason(&self) -> RejectReason {
        match self {
            LifecycleError::RoomEnded(_) => RejectReason::RoomEnded,
            LifecycleError::TooEarly { .. } => RejectReason::TooEarly,
            LifecycleError::NotHost { .. } => RejectReason::NotHost,
            LifecycleError::InvalidTransition { .. } | LifecycleError::Registry(_) => {
                RejectReason::InvalidTransition
            }
            LifecycleError::RoomNotFound(_) => RejectReason::RoomNotFound,
            LifecycleError::AlreadyExists(_) => RejectReason::AlreadyExists,
            LifecycleError::Store(_) => RejectReason::StoreUnavailable,
        }
    }

    /// Whole seconds until a too-early start may be retried, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LifecycleError::TooEarly { remaining, .. } => {
                let secs = remaining.as_secs();
                Some(if remaining.subsec_nanos() > 0 { secs + 1 } else { secs })
            }
            _ => None,
        }
    }
}

/// Bounded exponential backoff for store writes.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconcilePolicy {
    /// Delay before retry number `attempt` (1-based), with up to half of it jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let half = ceiling / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up. Returns the number of
/// attempts taken.
pub async fn with_backoff<F, Fut>(
    policy: ReconcilePolicy,
    operation: &'static str,
    room_id: &str,
    mut op: F,
) -> Result<u32, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => {
                histogram!("live_relay_reconciliation_attempts", attempt as f64, "operation" => operation);
                return Ok(attempt);
            }
            Err(err) if attempt >= attempts => {
                error!(
                    room_id = %room_id,
                    operation,
                    attempts = attempt,
                    error = %err,
                    "reconciliation failed"
                );
                counter!("live_relay_reconciliation_failures_total", 1, "operation" => operation);
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    room_id = %room_id,
                    operation,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "store write failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Outcome of ending a room.
#[derive(Debug)]
pub struct EndReport {
    pub snapshot: RoomSnapshot,
    /// Members sent the end broadcast.
    pub notified: usize,
    /// Background store reconciliation; resolves to whether it succeeded.
    pub reconciliation: JoinHandle<bool>,
}

#[derive(Clone)]
pub struct LifecycleController {
    registry: RoomRegistry,
    router: RelayRouter,
    store: SharedSessionStore,
    clock: SharedClock,
    policy: ReconcilePolicy,
    vacancy_grace: Duration,
}

impl LifecycleController {
    pub fn new(
        registry: RoomRegistry,
        router: RelayRouter,
        store: SharedSessionStore,
        clock: SharedClock,
        config: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            clock,
            policy: config.reconcile_policy(),
            vacancy_grace: config.vacancy_grace,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn seed_from(record: &SessionRecord) -> RoomSeed {
        RoomSeed {
            status: record.status,
            host_id: record.host_id.clone(),
            scheduled_for: record.scheduled_for,
            started_at: record.started_at,
        }
    }

    fn authorize(snapshot: &RoomSnapshot, actor: &Actor) -> Result<(), LifecycleError> {
        match actor {
            Actor::Admin => Ok(()),
            Actor::Member(user_id) if snapshot.host_id.as_deref() == Some(user_id.as_str()) => {
                Ok(())
            }
            Actor::Member(user_id) => Err(LifecycleError::NotHost {
                room_id: snapshot.room_id.clone(),
                user_id: user_id.clone(),
            }),
        }
    }

    fn publish_room_gauge(&self) {
        gauge!("live_relay_rooms_active", self.registry.len() as f64);
    }

    /// Creates the external session and mirrors it as a scheduled room.
    pub async fn create(
        &self,
        room_id: &str,
        host_id: &str,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<RoomSnapshot, LifecycleError> {
        if self.registry.contains(room_id) {
            return Err(LifecycleError::AlreadyExists(room_id.to_string()));
        }
        let record = match self.store.create(room_id, host_id, scheduled_for).await {
            Ok(record) => record,
            Err(StoreError::AlreadyExists(id)) => return Err(LifecycleError::AlreadyExists(id)),
            Err(err) => return Err(err.into()),
        };
        let snapshot = self
            .registry
            .seed_room(room_id, Self::seed_from(&record), self.now());
        info!(room_id = %room_id, host_id = %host_id, scheduled_for = ?scheduled_for, "room created");
        self.publish_room_gauge();
        Ok(snapshot)
    }

    /// Returns the in-memory room, mirroring it from the store on first sight. Rooms the store
    /// has never heard of are opened fresh; a store that cannot be reached is an error, since
    /// host and schedule would otherwise be lost.
    pub async fn ensure_room(&self, room_id: &str) -> Result<RoomSnapshot, LifecycleError> {
        if let Some(snapshot) = self.registry.snapshot(room_id) {
            return Ok(snapshot);
        }
        let snapshot = match self.store.find_session(room_id).await {
            Ok(Some(record)) => {
                self.registry
                    .seed_room(room_id, Self::seed_from(&record), self.now())
            }
            Ok(None) => self.registry.get_or_create_room(room_id, self.now()),
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "session lookup failed");
                counter!("live_relay_store_lookup_failures_total", 1);
                return Err(err.into());
            }
        };
        self.publish_room_gauge();
        Ok(snapshot)
    }

    /// Room state for the outer surface, mirroring known sessions. Unknown rooms are not
    /// created.
    pub async fn describe(&self, room_id: &str) -> Result<RoomSnapshot, LifecycleError> {
        if let Some(snapshot) = self.registry.snapshot(room_id) {
            return Ok(snapshot);
        }
        match self.store.find_session(room_id).await? {
            Some(record) => Ok(self
                .registry
                .seed_room(room_id, Self::seed_from(&record), self.now())),
            None => Err(LifecycleError::RoomNotFound(room_id.to_string())),
        }
    }

    /// Admits a user on `handle`. The joiner is acked with `joined` and told about every peer;
    /// each peer hears `user-connected` with its own initiator hint.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        handle: ConnectionHandle,
    ) -> Result<Admission, LifecycleError> {
        let mut attempt = 0;
        let admission = loop {
            attempt += 1;
            let snapshot = self.ensure_room(room_id).await?;
            let now = self.now();

            if snapshot.status == RoomStatus::Scheduled && snapshot.scheduled_for.is_none() {
                match self.registry.set_status(room_id, RoomStatus::Live, now) {
                    Ok(_) => {
                        info!(room_id = %room_id, "unscheduled room went live on first join");
                        self.spawn_mark_started(room_id, now);
                    }
                    Err(err) => debug!(room_id = %room_id, error = %err, "auto start skipped"),
                }
            }

            let member = Member::new(user_id, user_name, handle.clone(), now);
            let admitted = self.registry.add_member_with(room_id, member, now, |admission| {
                self.announce_admission(room_id, user_id, user_name, &handle, admission)
            });
            match admitted {
                Ok(admission) => break admission,
                Err(RegistryError::RoomNotFound(_)) if attempt < ADMISSION_ATTEMPTS => {
                    debug!(room_id = %room_id, attempt, "room evicted during join; mirroring again");
                }
                Err(err) => return Err(LifecycleError::from_registry(err)),
            }
        };

        if let Some(displaced) = &admission.displaced {
            info!(
                room_id = %room_id,
                user_id = %user_id,
                stale_connection = %displaced.connection.id(),
                "duplicate join supersedes older connection"
            );
        }
        if !admission.rejoined {
            info!(
                room_id = %room_id,
                user_id = %user_id,
                role = ?admission.member.role,
                members = admission.snapshot.members.len(),
                "member joined"
            );
            counter!("live_relay_joins_total", 1);
            self.spawn_record_participant(room_id, user_id);
        }
        Ok(admission)
    }

    /// Runs under the room lock: acks the joiner, retires a superseded connection and
    /// introduces the joiner and its peers to each other.
    fn announce_admission(
        &self,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        handle: &ConnectionHandle,
        admission: &Admission,
    ) {
        self.router.send_to(
            handle,
            ServerMessage::Joined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                role: admission.member.role,
                status: admission.snapshot.status,
            },
        );

        if let Some(displaced) = &admission.displaced {
            self.router.fan_out(
                &admission.peers,
                None,
                &ServerMessage::UserDisconnected {
                    user_id: user_id.to_string(),
                },
            );
            displaced.connection.close(CloseReason::Superseded);
        }

        for peer in &admission.peers {
            self.router.send_to(
                handle,
                ServerMessage::UserConnected {
                    user_id: peer.user_id.clone(),
                    user_name: peer.user_name.clone(),
                    socket_id: peer.connection.id().to_string(),
                    initiator: should_initiate(user_id, &peer.user_id),
                },
            );
            if !admission.rejoined {
                self.router.send_to(
                    &peer.connection,
                    ServerMessage::UserConnected {
                        user_id: user_id.to_string(),
                        user_name: user_name.to_string(),
                        socket_id: handle.id().to_string(),
                        initiator: should_initiate(&peer.user_id, user_id),
                    },
                );
            }
        }
    }

    /// Removes a member and tells the rest of the room. Returns false when nothing was
    /// removed (already gone, or superseded by a newer connection).
    pub fn leave(&self, room_id: &str, user_id: &str, connection_id: Option<ConnectionId>) -> bool {
        let departed = self.registry.remove_member_with(
            room_id,
            user_id,
            connection_id,
            self.now(),
            |departure| {
                self.router.fan_out(
                    &departure.peers,
                    None,
                    &ServerMessage::UserDisconnected {
                        user_id: user_id.to_string(),
                    },
                );
            },
        );
        let Some(departure) = departed else {
            return false;
        };
        info!(
            room_id = %room_id,
            user_id = %user_id,
            remaining = departure.remaining,
            links_closed = departure.closed_links.len(),
            "member left"
        );
        true
    }

    pub fn start(&self, room_id: &str, actor: &Actor) -> Result<RoomSnapshot, LifecycleError> {
        let snapshot = self
            .registry
            .snapshot(room_id)
            .ok_or_else(|| LifecycleError::RoomNotFound(room_id.to_string()))?;
        Self::authorize(&snapshot, actor)?;
        if snapshot.status != RoomStatus::Scheduled {
            return Err(LifecycleError::InvalidTransition {
                room_id: room_id.to_string(),
                from: snapshot.status,
                to: RoomStatus::Live,
            });
        }

        let now = self.now();
        if let Some(scheduled_for) = snapshot.scheduled_for {
            if now < scheduled_for {
                let remaining = (scheduled_for - now).to_std().unwrap_or_default();
                return Err(LifecycleError::TooEarly {
                    room_id: room_id.to_string(),
                    remaining,
                });
            }
        }

        let snapshot = self
            .registry
            .set_status(room_id, RoomStatus::Live, now)
            .map_err(|err| LifecycleError::transition(room_id, err))?;
        let started_at = snapshot.started_at.unwrap_or(now);
        let announced = self.router.broadcast(
            room_id,
            None,
            &ServerMessage::SessionStarted {
                room_id: room_id.to_string(),
                started_at,
            },
        );
        if let Err(err) = announced {
            debug!(room_id = %room_id, error = %err, "session-started broadcast skipped");
        }
        info!(room_id = %room_id, actor = ?actor, "session started");
        counter!("live_relay_sessions_started_total", 1);
        self.spawn_mark_started(room_id, started_at);
        Ok(snapshot)
    }

    /// Ends the room: status first, then one `end-session` to every member, then the
    /// connections are closed. The store is reconciled in the background.
    pub fn end(&self, room_id: &str, actor: &Actor) -> Result<EndReport, LifecycleError> {
        let snapshot = self
            .registry
            .snapshot(room_id)
            .ok_or_else(|| LifecycleError::RoomNotFound(room_id.to_string()))?;
        Self::authorize(&snapshot, actor)?;

        let now = self.now();
        let snapshot = self
            .registry
            .set_status(room_id, RoomStatus::Ended, now)
            .map_err(|err| LifecycleError::transition(room_id, err))?;
        let members = self.registry.drain_members(room_id, now);

        let frame = ServerMessage::EndSession {
            room_id: room_id.to_string(),
            admin_id: actor.user_id().map(str::to_string),
            ended_at: now,
        };
        let notified = members
            .iter()
            .filter(|member| {
                let sent = self.router.send_to(&member.connection, frame.clone());
                member.connection.close(CloseReason::SessionEnded);
                sent
            })
            .count();

        let duration_secs = snapshot
            .started_at
            .map(|started| (now - started).num_seconds().max(0) as u64)
            .unwrap_or(0);
        info!(
            room_id = %room_id,
            actor = ?actor,
            notified,
            duration_secs,
            "session ended"
        );
        counter!("live_relay_sessions_ended_total", 1);

        let reconciliation =
            self.spawn_mark_ended(room_id, now, duration_secs, snapshot.participants.clone());
        Ok(EndReport {
            snapshot,
            notified,
            reconciliation,
        })
    }

    fn spawn_mark_started(&self, room_id: &str, at: DateTime<Utc>) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            with_backoff(policy, "mark_started", &room_id, || store.mark_started(&room_id, at))
                .await
                .is_ok()
        })
    }

    fn spawn_mark_ended(
        &self,
        room_id: &str,
        at: DateTime<Utc>,
        duration_secs: u64,
        participants: Vec<String>,
    ) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let registry = self.registry.clone();
        let policy = self.policy;
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            match with_backoff(policy, "mark_ended", &room_id, || {
                store.mark_ended(&room_id, at, duration_secs, &participants)
            })
            .await
            {
                Ok(attempts) => {
                    registry.settle_end(&room_id);
                    debug!(room_id = %room_id, attempts, "end of session reconciled");
                    true
                }
                Err(_) => {
                    warn!(room_id = %room_id, "store still shows the session open; keeping the ended room in memory");
                    false
                }
            }
        })
    }

    fn spawn_record_participant(&self, room_id: &str, user_id: &str) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let room_id = room_id.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            with_backoff(policy, "record_participant", &room_id, || {
                store.record_participant(&room_id, &user_id)
            })
            .await
            .is_ok()
        })
    }

    /// Evicts rooms that have been empty for longer than the vacancy grace.
    pub fn sweep(&self) -> Vec<String> {
        let grace = chrono::Duration::from_std(self.vacancy_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let evicted = self.registry.evict_vacant(self.now(), grace);
        for room_id in &evicted {
            debug!(room_id = %room_id, "evicted vacant room");
        }
        if !evicted.is_empty() {
            counter!("live_relay_rooms_evicted_total", evicted.len() as u64);
        }
        self.publish_room_gauge();
        evicted
    }

    pub fn spawn_sweeper(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = self.clone();
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        controller.sweep();
                    }
                }
            }
        })
    }

    /// Closes every registered connection without ending any session; clients reconnect to
    /// a fresh process and rejoin.
    pub fn shutdown_all(&self) -> usize {
        let connections = self.registry.all_connections();
        let closed = connections
            .iter()
            .filter(|connection| connection.close(CloseReason::ServerShutdown))
            .count();
        info!(closed, "closed connections for shutdown");
        closed
    }
}
