//! Process-local registry of live rooms.
//!
//! The map itself is a [`DashMap`]; each room sits behind its own `parking_lot` mutex so that
//! membership changes and peer-link bookkeeping for one room are linearized without blocking
//! other rooms. Nothing in this module awaits or touches a socket. Membership notifications are
//! enqueued from `notify` hooks that run under the room lock, so every peer sees joins and
//! departures in the order they were applied.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::pairing::{LinkPhase, PairingError, PeerLink, PeerLinks};
use crate::signaling::SignalKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Scheduled,
    Live,
    Ended,
}

impl RoomStatus {
    fn rank(self) -> u8 {
        match self {
            RoomStatus::Scheduled => 0,
            RoomStatus::Live => 1,
            RoomStatus::Ended => 2,
        }
    }

    /// Status only moves forward: scheduled, then live, then ended.
    pub fn can_advance_to(self, next: RoomStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Scheduled => "scheduled",
            RoomStatus::Live => "live",
            RoomStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Host,
    Participant,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    pub user_name: String,
    pub role: MemberRole,
    pub connection: ConnectionHandle,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// The role is assigned by the registry on admission.
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        connection: ConnectionHandle,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            role: MemberRole::Participant,
            connection,
            joined_at,
        }
    }

    pub fn summary(&self) -> MemberSummary {
        MemberSummary {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role: self.role,
            socket_id: self.connection.id().to_string(),
            joined_at: self.joined_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSummary {
    pub user_id: String,
    pub user_name: String,
    pub role: MemberRole,
    pub socket_id: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub status: RoomStatus,
    pub host_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub members: Vec<MemberSummary>,
    pub participants: Vec<String>,
    pub peer_links: usize,
}

impl RoomSnapshot {
    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.user_id.clone()).collect()
    }
}

/// Initial values for a room mirrored from the session store.
#[derive(Debug, Clone)]
pub struct RoomSeed {
    pub status: RoomStatus,
    pub host_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for RoomSeed {
    fn default() -> Self {
        Self {
            status: RoomStatus::Scheduled,
            host_id: None,
            scheduled_for: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("room {0} has ended")]
    RoomEnded(String),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RoomStatus, to: RoomStatus },
    #[error("user {user_id} is not a member of room {room_id}")]
    MemberNotFound { room_id: String, user_id: String },
    #[error(transparent)]
    Pairing(#[from] PairingError),
}

/// Result of admitting a member.
#[derive(Debug)]
pub struct Admission {
    pub snapshot: RoomSnapshot,
    pub member: MemberSummary,
    /// Everyone else present at admission time.
    pub peers: Vec<Member>,
    /// Older connection of the same user, superseded by this join.
    pub displaced: Option<Member>,
    /// The same connection joined again; nothing changed for peers.
    pub rejoined: bool,
}

#[derive(Debug)]
pub struct Departure {
    pub member: Member,
    /// Members still present after the removal.
    pub peers: Vec<Member>,
    pub remaining: usize,
    pub closed_links: Vec<PeerLink>,
}

struct Room {
    id: String,
    status: RoomStatus,
    host_id: Option<String>,
    scheduled_for: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    members: HashMap<String, Member>,
    links: PeerLinks,
    participants: BTreeSet<String>,
    vacant_since: Option<DateTime<Utc>>,
    /// Ended here but not yet recorded as ended in the store; the room must outlive eviction.
    pending_end: bool,
    evicted: bool,
}

impl Room {
    fn new(id: &str, seed: RoomSeed, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            status: seed.status,
            host_id: seed.host_id,
            scheduled_for: seed.scheduled_for,
            started_at: seed.started_at,
            ended_at: None,
            members: HashMap::new(),
            links: PeerLinks::default(),
            participants: BTreeSet::new(),
            vacant_since: Some(now),
            pending_end: false,
            evicted: false,
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut members: Vec<MemberSummary> = self.members.values().map(Member::summary).collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        RoomSnapshot {
            room_id: self.id.clone(),
            status: self.status,
            host_id: self.host_id.clone(),
            scheduled_for: self.scheduled_for,
            started_at: self.started_at,
            ended_at: self.ended_at,
            members,
            participants: self.participants.iter().cloned().collect(),
            peer_links: self.links.len(),
        }
    }

    fn member_not_found(&self, user_id: &str) -> RegistryError {
        RegistryError::MemberNotFound {
            room_id: self.id.clone(),
            user_id: user_id.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    fn room_or_insert(&self, room_id: &str, seed: RoomSeed, now: DateTime<Utc>) -> Arc<Mutex<Room>> {
        let entry = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id, seed, now))));
        Arc::clone(entry.value())
    }

    /// Runs `f` on the room, creating it when unknown. Retries if the sweeper evicted the room
    /// between lookup and lock.
    fn with_room_or_create<T>(
        &self,
        room_id: &str,
        seed: RoomSeed,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Room) -> T,
    ) -> T {
        loop {
            let room = self.room_or_insert(room_id, seed.clone(), now);
            let mut guard = room.lock();
            if guard.evicted {
                continue;
            }
            return f(&mut guard);
        }
    }

    fn with_room<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let room = self
            .room(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut guard = room.lock();
        if guard.evicted {
            return Err(RegistryError::RoomNotFound(room_id.to_string()));
        }
        f(&mut guard)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.snapshot(room_id).is_some()
    }

    /// Idempotent; unknown rooms start out scheduled.
    pub fn get_or_create_room(&self, room_id: &str, now: DateTime<Utc>) -> RoomSnapshot {
        self.with_room_or_create(room_id, RoomSeed::default(), now, |room| room.snapshot())
    }

    /// Mirrors an externally known session. Existing rooms are returned untouched.
    pub fn seed_room(&self, room_id: &str, seed: RoomSeed, now: DateTime<Utc>) -> RoomSnapshot {
        self.with_room_or_create(room_id, seed, now, |room| room.snapshot())
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.with_room(room_id, |room| Ok(room.snapshot())).ok()
    }

    pub fn snapshots(&self) -> Vec<RoomSnapshot> {
        let ids: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        let mut snapshots: Vec<RoomSnapshot> =
            ids.iter().filter_map(|id| self.snapshot(id)).collect();
        snapshots.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn add_member(
        &self,
        room_id: &str,
        member: Member,
        now: DateTime<Utc>,
    ) -> Result<Admission, RegistryError> {
        self.add_member_with(room_id, member, now, |_| {})
    }

    /// Admits `member`, creating peer links with everyone already present. The room must
    /// already exist. `notify` runs before the room lock is released; it may only enqueue.
    pub fn add_member_with(
        &self,
        room_id: &str,
        mut member: Member,
        now: DateTime<Utc>,
        notify: impl FnOnce(&Admission),
    ) -> Result<Admission, RegistryError> {
        self.with_room(room_id, |room| {
            if room.status == RoomStatus::Ended {
                return Err(RegistryError::RoomEnded(room.id.clone()));
            }

            let user_id = member.user_id.clone();
            let mut displaced = None;
            let mut rejoined = false;
            if let Some(existing) = room.members.get(&user_id) {
                if existing.connection.id() == member.connection.id() {
                    rejoined = true;
                } else {
                    displaced = room.members.remove(&user_id);
                    room.links.remove_user(&user_id);
                }
            }

            if room.host_id.is_none() {
                room.host_id = Some(user_id.clone());
            }
            member.role = if room.host_id.as_deref() == Some(user_id.as_str()) {
                MemberRole::Host
            } else {
                MemberRole::Participant
            };

            let summary = match room.members.get_mut(&user_id) {
                Some(existing) if rejoined => {
                    existing.user_name = member.user_name.clone();
                    existing.summary()
                }
                _ => member.summary(),
            };
            if !rejoined {
                room.members.insert(user_id.clone(), member);
            }

            let others: Vec<String> = room
                .members
                .keys()
                .filter(|id| **id != user_id)
                .cloned()
                .collect();
            for other in &others {
                room.links.ensure(&user_id, other)?;
            }

            room.participants.insert(user_id.clone());
            room.vacant_since = None;

            let peers = room
                .members
                .values()
                .filter(|m| m.user_id != user_id)
                .cloned()
                .collect();

            let admission = Admission {
                snapshot: room.snapshot(),
                member: summary,
                peers,
                displaced,
                rejoined,
            };
            notify(&admission);
            Ok(admission)
        })
    }

    pub fn remove_member(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: Option<ConnectionId>,
        now: DateTime<Utc>,
    ) -> Option<Departure> {
        self.remove_member_with(room_id, user_id, connection_id, now, |_| {})
    }

    /// Removes a member. When `connection_id` is given the removal only applies to that
    /// connection, so a stale socket closing cannot evict a newer one. `notify` runs under the
    /// room lock, as in [`add_member_with`](Self::add_member_with).
    pub fn remove_member_with(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: Option<ConnectionId>,
        now: DateTime<Utc>,
        notify: impl FnOnce(&Departure),
    ) -> Option<Departure> {
        self.with_room(room_id, |room| {
            let matches = room
                .members
                .get(user_id)
                .map(|m| connection_id.map_or(true, |id| m.connection.id() == id))
                .unwrap_or(false);
            if !matches {
                return Err(room.member_not_found(user_id));
            }
            let member = room
                .members
                .remove(user_id)
                .ok_or_else(|| room.member_not_found(user_id))?;
            let closed_links = room.links.remove_user(user_id);
            if room.members.is_empty() {
                room.vacant_since = Some(now);
            }
            let departure = Departure {
                member,
                peers: room.members.values().cloned().collect(),
                remaining: room.members.len(),
                closed_links,
            };
            notify(&departure);
            Ok(departure)
        })
        .ok()
    }

    pub fn set_status(
        &self,
        room_id: &str,
        next: RoomStatus,
        now: DateTime<Utc>,
    ) -> Result<RoomSnapshot, RegistryError> {
        self.with_room(room_id, |room| {
            if !room.status.can_advance_to(next) {
                return Err(RegistryError::InvalidTransition {
                    from: room.status,
                    to: next,
                });
            }
            room.status = next;
            match next {
                RoomStatus::Live => room.started_at = Some(now),
                RoomStatus::Ended => {
                    room.ended_at = Some(now);
                    room.pending_end = true;
                }
                RoomStatus::Scheduled => {}
            }
            Ok(room.snapshot())
        })
    }

    /// The store now records the room as ended, so it may be evicted once vacant.
    pub fn settle_end(&self, room_id: &str) -> bool {
        self.with_room(room_id, |room| {
            room.pending_end = false;
            Ok(())
        })
        .is_ok()
    }

    /// Removes every member and link, leaving the room vacant.
    pub fn drain_members(&self, room_id: &str, now: DateTime<Utc>) -> Vec<Member> {
        self.with_room(room_id, |room| {
            room.links.clear();
            room.vacant_since = Some(now);
            Ok(room.members.drain().map(|(_, member)| member).collect())
        })
        .unwrap_or_default()
    }

    pub fn members(&self, room_id: &str) -> Result<Vec<Member>, RegistryError> {
        self.with_room(room_id, |room| Ok(room.members.values().cloned().collect()))
    }

    pub fn member(&self, room_id: &str, user_id: &str) -> Result<Member, RegistryError> {
        self.with_room(room_id, |room| {
            room.members
                .get(user_id)
                .cloned()
                .ok_or_else(|| room.member_not_found(user_id))
        })
    }

    pub fn peer_link(&self, room_id: &str, a: &str, b: &str) -> Option<PeerLink> {
        self.with_room(room_id, |room| Ok(room.links.get(a, b).cloned()))
            .ok()
            .flatten()
    }

    /// Validates a point-to-point signal against membership and the pair's link, advancing
    /// the link phase. Returns the target's connection.
    pub fn record_signal(
        &self,
        room_id: &str,
        from: &str,
        to: &str,
        kind: SignalKind,
    ) -> Result<(ConnectionHandle, LinkPhase), RegistryError> {
        self.with_room(room_id, |room| {
            if !room.members.contains_key(from) {
                return Err(room.member_not_found(from));
            }
            let target = room
                .members
                .get(to)
                .map(|m| m.connection.clone())
                .ok_or_else(|| room.member_not_found(to))?;
            room.links.ensure(from, to)?;
            let link = room
                .links
                .get_mut(from, to)
                .ok_or_else(|| RegistryError::Pairing(PairingError::Closed))?;
            let phase = match kind {
                SignalKind::Offer => link.on_offer(from)?,
                SignalKind::Answer => link.on_answer(from)?,
                SignalKind::IceCandidate => link.on_candidate()?,
                _ => link.phase,
            };
            Ok((target, phase))
        })
    }

    pub fn report_link(
        &self,
        room_id: &str,
        from: &str,
        to: &str,
        phase: LinkPhase,
    ) -> Result<LinkPhase, RegistryError> {
        self.with_room(room_id, |room| {
            if !room.members.contains_key(from) {
                return Err(room.member_not_found(from));
            }
            let missing = room.member_not_found(to);
            let link = room.links.get_mut(from, to).ok_or(missing)?;
            Ok(link.report(phase)?)
        })
    }

    /// Drops rooms that have been empty for at least `grace`. Rooms whose end has not reached
    /// the store are kept so the ended status cannot be lost.
    pub fn evict_vacant(&self, now: DateTime<Utc>, grace: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.rooms.retain(|room_id, room| {
            let mut guard = room.lock();
            let expired = guard.members.is_empty()
                && !guard.pending_end
                && guard
                    .vacant_since
                    .map_or(false, |since| now.signed_duration_since(since) >= grace);
            if expired {
                guard.evicted = true;
                evicted.push(room_id.clone());
            }
            !expired
        });
        evicted
    }

    /// Every connection currently registered, across all rooms.
    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        let rooms: Vec<Arc<Mutex<Room>>> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        rooms
            .iter()
            .flat_map(|room| {
                room.lock()
                    .members
                    .values()
                    .map(|m| m.connection.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user_id: &str) -> (Member, crate::connection::OutboundReceiver) {
        let (handle, rx) = ConnectionHandle::channel(8);
        (Member::new(user_id, user_id.to_uppercase(), handle, Utc::now()), rx)
    }

    #[test_timeout::timeout]
    fn status_only_moves_forward() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);

        registry.set_status("r1", RoomStatus::Live, now).unwrap();
        assert_eq!(
            registry.set_status("r1", RoomStatus::Scheduled, now),
            Err(RegistryError::InvalidTransition {
                from: RoomStatus::Live,
                to: RoomStatus::Scheduled
            })
        );
        assert!(registry.set_status("r1", RoomStatus::Live, now).is_err());
        registry.set_status("r1", RoomStatus::Ended, now).unwrap();
        assert_eq!(
            registry.set_status("r1", RoomStatus::Live, now),
            Err(RegistryError::InvalidTransition {
                from: RoomStatus::Ended,
                to: RoomStatus::Live
            })
        );
    }

    #[test_timeout::timeout]
    fn get_or_create_is_idempotent() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        let first = registry.get_or_create_room("r1", now);
        registry.set_status("r1", RoomStatus::Live, now).unwrap();
        let second = registry.get_or_create_room("r1", now);
        assert_eq!(first.status, RoomStatus::Scheduled);
        assert_eq!(second.status, RoomStatus::Live);
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn ended_room_rejects_joins() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        registry.set_status("r1", RoomStatus::Ended, now).unwrap();
        let (m, _rx) = member("u1");
        assert_eq!(
            registry.add_member("r1", m, now).unwrap_err(),
            RegistryError::RoomEnded("r1".into())
        );
    }

    #[test_timeout::timeout]
    fn first_joiner_claims_host_and_links_are_created() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (a, _ra) = member("u1");
        let (b, _rb) = member("u2");
        let (c, _rc) = member("u3");
        let first = registry.add_member("r1", a, now).unwrap();
        assert_eq!(first.member.role, MemberRole::Host);
        assert!(first.peers.is_empty());

        let second = registry.add_member("r1", b, now).unwrap();
        assert_eq!(second.member.role, MemberRole::Participant);
        assert_eq!(second.peers.len(), 1);

        let third = registry.add_member("r1", c, now).unwrap();
        assert_eq!(third.peers.len(), 2);
        assert_eq!(third.snapshot.peer_links, 3);

        let link = registry.peer_link("r1", "u1", "u3").unwrap();
        assert_eq!(link.initiator, "u3");
    }

    #[test_timeout::timeout]
    fn duplicate_join_supersedes_the_older_connection() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (old, _r1) = member("u1");
        let old_id = old.connection.id();
        let (peer, _r2) = member("u2");
        registry.add_member("r1", old, now).unwrap();
        registry.add_member("r1", peer, now).unwrap();

        let (fresh, _r3) = member("u1");
        let fresh_id = fresh.connection.id();
        let admission = registry.add_member("r1", fresh, now).unwrap();
        let displaced = admission.displaced.expect("older connection displaced");
        assert_eq!(displaced.connection.id(), old_id);
        assert_eq!(admission.snapshot.members.len(), 2);

        // the stale socket closing later must not remove the new one
        assert!(registry
            .remove_member("r1", "u1", Some(old_id), now)
            .is_none());
        assert_eq!(
            registry.member("r1", "u1").unwrap().connection.id(),
            fresh_id
        );
    }

    #[test_timeout::timeout]
    fn same_connection_rejoin_is_idempotent() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (m, _rx) = member("u1");
        let again = m.clone();
        registry.add_member("r1", m, now).unwrap();
        let admission = registry.add_member("r1", again, now).unwrap();
        assert!(admission.rejoined);
        assert!(admission.displaced.is_none());
        assert_eq!(admission.snapshot.members.len(), 1);
    }

    #[test_timeout::timeout]
    fn signals_advance_the_link() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (a, _ra) = member("u1");
        let (b, _rb) = member("u2");
        registry.add_member("r1", a, now).unwrap();
        registry.add_member("r1", b, now).unwrap();

        assert!(matches!(
            registry.record_signal("r1", "u1", "u2", SignalKind::Offer),
            Err(RegistryError::Pairing(PairingError::NotInitiator { .. }))
        ));
        let (_, phase) = registry
            .record_signal("r1", "u2", "u1", SignalKind::Offer)
            .unwrap();
        assert_eq!(phase, LinkPhase::OfferSent);
        let (_, phase) = registry
            .record_signal("r1", "u1", "u2", SignalKind::Answer)
            .unwrap();
        assert_eq!(phase, LinkPhase::AnswerSent);
        assert_eq!(
            registry.report_link("r1", "u1", "u2", LinkPhase::Connected),
            Ok(LinkPhase::Connected)
        );
        assert_eq!(
            registry.record_signal("r1", "u2", "u9", SignalKind::IceCandidate).unwrap_err(),
            RegistryError::MemberNotFound {
                room_id: "r1".into(),
                user_id: "u9".into()
            }
        );
    }

    #[test_timeout::timeout]
    fn vacant_rooms_are_evicted_after_grace() {
        let registry = RoomRegistry::new();
        let start = Utc::now();
        registry.get_or_create_room("r1", start);
        let (m, _rx) = member("u1");
        let conn = m.connection.id();
        registry.add_member("r1", m, start).unwrap();
        registry.set_status("r1", RoomStatus::Live, start).unwrap();

        let left = start + Duration::seconds(5);
        let departure = registry.remove_member("r1", "u1", Some(conn), left).unwrap();
        assert_eq!(departure.remaining, 0);

        let grace = Duration::seconds(60);
        assert!(registry
            .evict_vacant(left + Duration::seconds(30), grace)
            .is_empty());
        assert_eq!(registry.snapshot("r1").unwrap().status, RoomStatus::Live);

        assert_eq!(
            registry.evict_vacant(left + Duration::seconds(61), grace),
            vec!["r1".to_string()]
        );
        assert!(!registry.contains("r1"));
    }

    #[test_timeout::timeout]
    fn occupied_rooms_are_never_evicted() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (m, _rx) = member("u1");
        registry.add_member("r1", m, now).unwrap();
        assert!(registry
            .evict_vacant(now + Duration::days(1), Duration::seconds(1))
            .is_empty());
    }

    #[test_timeout::timeout]
    fn joining_an_unknown_room_does_not_create_it() {
        let registry = RoomRegistry::new();
        let (m, _rx) = member("u1");
        assert_eq!(
            registry.add_member("r1", m, Utc::now()).unwrap_err(),
            RegistryError::RoomNotFound("r1".into())
        );
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn membership_hooks_run_under_the_room_lock() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        let (a, _ra) = member("u1");
        let (b, _rb) = member("u2");
        let a_conn = a.connection.id();
        registry.add_member("r1", a, now).unwrap();

        let mut seen = Vec::new();
        registry
            .add_member_with("r1", b, now, |admission| {
                let room = registry.room("r1").unwrap();
                assert!(room.try_lock().is_none());
                seen.extend(admission.peers.iter().map(|p| p.user_id.clone()));
            })
            .unwrap();
        assert_eq!(seen, vec!["u1".to_string()]);

        let mut remaining = Vec::new();
        registry
            .remove_member_with("r1", "u1", Some(a_conn), now, |departure| {
                let room = registry.room("r1").unwrap();
                assert!(room.try_lock().is_none());
                remaining.extend(departure.peers.iter().map(|p| p.user_id.clone()));
            })
            .unwrap();
        assert_eq!(remaining, vec!["u2".to_string()]);
    }

    #[test_timeout::timeout]
    fn ended_rooms_stay_until_the_end_is_settled() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        registry.get_or_create_room("r1", now);
        registry.set_status("r1", RoomStatus::Ended, now).unwrap();

        let grace = Duration::seconds(60);
        let later = now + Duration::seconds(600);
        assert!(registry.evict_vacant(later, grace).is_empty());
        assert_eq!(registry.snapshot("r1").unwrap().status, RoomStatus::Ended);

        assert!(registry.settle_end("r1"));
        assert_eq!(registry.evict_vacant(later, grace), vec!["r1".to_string()]);
        assert!(!registry.settle_end("r1"));
    }

    #[test_timeout::timeout]
    fn ended_rooms_seeded_from_the_store_are_evictable() {
        let registry = RoomRegistry::new();
        let now = Utc::now();
        let seed = RoomSeed {
            status: RoomStatus::Ended,
            ..RoomSeed::default()
        };
        registry.seed_room("r1", seed, now);
        assert_eq!(
            registry.evict_vacant(now + Duration::seconds(61), Duration::seconds(60)),
            vec!["r1".to_string()]
        );
    }
}
