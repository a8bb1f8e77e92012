//! Session persistence collaborator.
//!
//! The relay only needs the last known status of a session, so the store is a small
//! interface: create, look up, and record start, end and participants. Two adapters ship
//! with the crate: an in-memory store for tests and single-process setups, and a Redis store
//! that keeps `session:{id}` records with a TTL. Record updates are forward-only in both: a
//! late start never overwrites an end.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::registry::RoomStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub room_id: String,
    pub host_id: Option<String>,
    pub status: RoomStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        room_id: impl Into<String>,
        host_id: Option<String>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            host_id,
            status: RoomStatus::Scheduled,
            scheduled_for,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            participants: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn mark_started(&mut self, at: DateTime<Utc>) {
        if self.status == RoomStatus::Scheduled {
            self.status = RoomStatus::Live;
        }
        self.started_at.get_or_insert(at);
    }

    fn mark_ended(&mut self, at: DateTime<Utc>, duration_secs: u64, participants: &[String]) {
        self.status = RoomStatus::Ended;
        self.ended_at = Some(at);
        self.duration_secs = Some(duration_secs);
        let mut merged: BTreeSet<String> = self.participants.drain(..).collect();
        merged.extend(participants.iter().cloned());
        self.participants = merged.into_iter().collect();
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} kept changing underneath the update")]
    Conflict(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        room_id: &str,
        host_id: &str,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<SessionRecord, StoreError>;

    async fn find_session(&self, room_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn find_status(&self, room_id: &str) -> Result<Option<RoomStatus>, StoreError> {
        Ok(self.find_session(room_id).await?.map(|record| record.status))
    }

    /// Upserts: rooms opened without a record still get one.
    async fn mark_started(&self, room_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_ended(
        &self,
        room_id: &str,
        at: DateTime<Utc>,
        duration_secs: u64,
        participants: &[String],
    ) -> Result<(), StoreError>;

    async fn record_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        room_id: &str,
        host_id: &str,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(room_id) {
            return Err(StoreError::AlreadyExists(room_id.to_string()));
        }
        let record = SessionRecord::new(room_id, Some(host_id.to_string()), scheduled_for);
        sessions.insert(room_id.to_string(), record.clone());
        Ok(record)
    }

    async fn find_session(&self, room_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().await.get(room_id).cloned())
    }

    async fn mark_started(&self, room_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .entry(room_id.to_string())
            .or_insert_with(|| SessionRecord::new(room_id, None, None))
            .mark_started(at);
        Ok(())
    }

    async fn mark_ended(
        &self,
        room_id: &str,
        at: DateTime<Utc>,
        duration_secs: u64,
        participants: &[String],
    ) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .entry(room_id.to_string())
            .or_insert_with(|| SessionRecord::new(room_id, None, None))
            .mark_ended(at, duration_secs, participants);
        Ok(())
    }

    async fn record_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .entry(room_id.to_string())
            .or_insert_with(|| SessionRecord::new(room_id, None, None));
        if !record.participants.iter().any(|p| p == user_id) {
            record.participants.push(user_id.to_string());
        }
        Ok(())
    }
}

/// Replaces `KEYS[1]` with `ARGV[2]` only while it still holds `ARGV[1]` (empty: absent).
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

const UPDATE_ATTEMPTS: u32 = 8;

/// Serialized record after applying `apply` to the stored value, or to a fresh record when
/// nothing is stored yet.
fn updated_value(
    room_id: &str,
    current: Option<&str>,
    apply: impl FnOnce(&mut SessionRecord),
) -> Result<String, StoreError> {
    let mut record = match current {
        Some(raw) => serde_json::from_str(raw)?,
        None => SessionRecord::new(room_id, None, None),
    };
    apply(&mut record);
    Ok(serde_json::to_string(&record)?)
}

#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisSessionStore {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }

    fn session_key(room_id: &str) -> String {
        format!("session:{}", room_id)
    }

    fn participants_key(room_id: &str) -> String {
        format!("session:{}:participants", room_id)
    }

    async fn load(&self, room_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(Self::session_key(room_id)).await?;
        value
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    /// Read, modify, compare-and-set. A concurrent writer makes the swap fail and the update
    /// is reapplied to the newer record.
    async fn update(
        &self,
        room_id: &str,
        apply: impl Fn(&mut SessionRecord),
    ) -> Result<(), StoreError> {
        let key = Self::session_key(room_id);
        let script = redis::Script::new(COMPARE_AND_SET);
        let mut conn = self.redis.clone();
        for attempt in 1..=UPDATE_ATTEMPTS {
            let current: Option<String> = conn.get(&key).await?;
            let next = updated_value(room_id, current.as_deref(), &apply)?;
            let swapped: i32 = script
                .key(&key)
                .arg(current.as_deref().unwrap_or(""))
                .arg(next)
                .arg(self.ttl_seconds)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(());
            }
            debug!(room_id = %room_id, attempt, "session record changed concurrently; reapplying");
        }
        Err(StoreError::Conflict(room_id.to_string()))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(
        &self,
        room_id: &str,
        host_id: &str,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord::new(room_id, Some(host_id.to_string()), scheduled_for);
        let value = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(Self::session_key(room_id))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        match created {
            Some(_) => Ok(record),
            None => Err(StoreError::AlreadyExists(room_id.to_string())),
        }
    }

    async fn find_session(&self, room_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Some(mut record) = self.load(room_id).await? else {
            return Ok(None);
        };
        let mut conn = self.redis.clone();
        let members: BTreeSet<String> = conn.smembers(Self::participants_key(room_id)).await?;
        members.into_iter().for_each(|member| {
            if !record.participants.contains(&member) {
                record.participants.push(member);
            }
        });
        Ok(Some(record))
    }

    async fn mark_started(&self, room_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(room_id, |record| record.mark_started(at)).await
    }

    async fn mark_ended(
        &self,
        room_id: &str,
        at: DateTime<Utc>,
        duration_secs: u64,
        participants: &[String],
    ) -> Result<(), StoreError> {
        self.update(room_id, |record| {
            record.mark_ended(at, duration_secs, participants)
        })
        .await
    }

    async fn record_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let key = Self::participants_key(room_id);
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SADD")
            .arg(&key)
            .arg(user_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test_timeout::tokio_timeout_test]
    async fn create_rejects_duplicates() {
        let store = MemorySessionStore::new();
        let record = store.create("r1", "host", None).await.unwrap();
        assert_eq!(record.status, RoomStatus::Scheduled);
        assert!(matches!(
            store.create("r1", "other", None).await,
            Err(StoreError::AlreadyExists(id)) if id == "r1"
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_and_end_update_the_record() {
        let store = MemorySessionStore::new();
        let at = Utc::now();
        store.create("r1", "host", Some(at)).await.unwrap();
        store.record_participant("r1", "u1").await.unwrap();
        store.mark_started("r1", at).await.unwrap();
        assert_eq!(store.find_status("r1").await.unwrap(), Some(RoomStatus::Live));

        let ended = at + Duration::seconds(90);
        store
            .mark_ended("r1", ended, 90, &["u2".to_string(), "u1".to_string()])
            .await
            .unwrap();
        let record = store.find_session("r1").await.unwrap().unwrap();
        assert_eq!(record.status, RoomStatus::Ended);
        assert_eq!(record.duration_secs, Some(90));
        assert_eq!(record.ended_at, Some(ended));
        assert_eq!(record.participants, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_rooms_are_upserted() {
        let store = MemorySessionStore::new();
        assert_eq!(store.find_status("adhoc").await.unwrap(), None);
        store.mark_started("adhoc", Utc::now()).await.unwrap();
        let record = store.find_session("adhoc").await.unwrap().unwrap();
        assert_eq!(record.status, RoomStatus::Live);
        assert_eq!(record.host_id, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_start_does_not_reopen_an_ended_session() {
        let store = MemorySessionStore::new();
        let at = Utc::now();
        store.create("r1", "host", None).await.unwrap();
        store.mark_ended("r1", at, 0, &[]).await.unwrap();
        store.mark_started("r1", at).await.unwrap();
        assert_eq!(store.find_status("r1").await.unwrap(), Some(RoomStatus::Ended));
    }

    #[test_timeout::timeout]
    fn updates_apply_to_the_stored_record() {
        let at = Utc::now();
        let mut ended = SessionRecord::new("r1", Some("host".into()), None);
        ended.mark_ended(at, 30, &["u1".to_string()]);
        let stored = serde_json::to_string(&ended).unwrap();

        let next = updated_value("r1", Some(stored.as_str()), |record| record.mark_started(at)).unwrap();
        let record: SessionRecord = serde_json::from_str(&next).unwrap();
        assert_eq!(record.status, RoomStatus::Ended);
        assert_eq!(record.host_id.as_deref(), Some("host"));
        assert_eq!(record.participants, vec!["u1".to_string()]);

        let fresh = updated_value("r2", None, |record| record.mark_started(at)).unwrap();
        let record: SessionRecord = serde_json::from_str(&fresh).unwrap();
        assert_eq!(record.status, RoomStatus::Live);
        assert_eq!(record.host_id, None);
    }
}
