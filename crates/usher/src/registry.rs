//! Session records and the persistence seam.
//!
//! A session is the binding of one slot to one room. Records exist only
//! while their slot is allocated; reaching a terminal status deletes the
//! record (the coordinator returns the slot in the same admission
//! section, so the two never drift apart).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::driver::{ConnectionInfo, SlotIndex};

/// Unique session identifier.
///
/// UUID v4 avoids confusion with slot indices and prevents accidental
/// reuse across a session's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Slot bound, client has not connected yet.
    Allocated,
    /// Client observed using the session.
    InUse,
    /// Explicitly released.
    Deallocated,
    /// Reaped by the TTL sweep.
    Expired,
    /// Driver or health failure.
    Error,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Allocated | Self::InUse)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::InUse => "in_use",
            Self::Deallocated => "deallocated",
            Self::Expired => "expired",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub room_id: String,
    pub slot_index: SlotIndex,
    pub status: SessionStatus,
    pub connection: ConnectionInfo,
    pub created_at: DateTime<Utc>,
    pub allocated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deallocated_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("room {0} already has an active session")]
    ActiveSessionExists(String),
}

/// Persistence contract for session records.
///
/// The bundled [`MemoryStore`] serves single-process deployments; a
/// shared store with compare-and-swap semantics can implement the same
/// contract for multi-instance deployments.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new record. Must fail when the room already has an
    /// active session (the per-room uniqueness invariant lives here).
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    async fn find_by_room(&self, room_id: &str) -> Result<Option<Session>, StoreError>;

    /// Overwrite an existing record in one save.
    async fn update(&self, session: Session) -> Result<(), StoreError>;

    /// Remove a record. Idempotent: removing an absent id is a no-op.
    async fn remove(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;
}

/// In-memory session store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let room_taken = self
            .sessions
            .iter()
            .any(|entry| entry.room_id == session.room_id && entry.status.is_active());
        if room_taken {
            return Err(StoreError::ActiveSessionExists(session.room_id));
        }
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_room(&self, room_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .find(|entry| entry.room_id == room_id)
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, session: Session) -> Result<(), StoreError> {
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn remove(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.remove(&id).map(|(_, session)| session))
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.iter().map(|entry| entry.value().clone()).collect())
    }
}

/// Registry over a [`SessionStore`]: owns the session state machine.
pub struct SessionRegistry {
    store: std::sync::Arc<dyn SessionStore>,
}

impl SessionRegistry {
    pub fn new(store: std::sync::Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(std::sync::Arc::new(MemoryStore::new()))
    }

    /// Create a session bound to `slot_index`. Fails when the room
    /// already holds an active session.
    pub async fn create(
        &self,
        room_id: &str,
        slot_index: SlotIndex,
        connection: ConnectionInfo,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::zero());
        let session = Session {
            id: SessionId::new(),
            room_id: room_id.to_string(),
            slot_index,
            status: SessionStatus::Allocated,
            connection,
            created_at: now,
            allocated_at: now,
            deallocated_at: None,
            expires_at: now + ttl,
            last_url: None,
        };
        self.store.insert(session.clone()).await?;
        tracing::info!(
            room = %room_id,
            session = %session.id,
            slot = slot_index,
            "Session created"
        );
        Ok(session)
    }

    /// The room's active session, if any.
    pub async fn active_for_room(&self, room_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .store
            .find_by_room(room_id)
            .await?
            .filter(|s| s.status.is_active()))
    }

    /// Delete a session, recording the terminal status it exits with.
    /// Idempotent: deleting an absent id returns `None`.
    pub async fn delete(
        &self,
        id: SessionId,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.store.remove(id).await? else {
            tracing::debug!(session = %id, "Delete of absent session is a no-op");
            return Ok(None);
        };
        session.status = status;
        session.deallocated_at = Some(now);
        tracing::info!(
            room = %session.room_id,
            session = %id,
            slot = session.slot_index,
            status = status.as_str(),
            "Session deleted"
        );
        Ok(Some(session))
    }

    /// Active sessions whose TTL has elapsed.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status.is_active() && s.expires_at <= now)
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        self.store.list().await
    }

    /// Drop records whose bound slot the runtime no longer reports as
    /// running. Startup self-healing after a crash or restart.
    pub async fn reconcile_orphans(
        &self,
        running: &HashSet<SlotIndex>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut removed = Vec::new();
        for session in self.store.list().await? {
            if running.contains(&session.slot_index) {
                continue;
            }
            if let Some(orphan) = self.store.remove(session.id).await? {
                tracing::warn!(
                    room = %orphan.room_id,
                    session = %orphan.id,
                    slot = orphan.slot_index,
                    "Orphaned session removed - slot not running"
                );
                removed.push(orphan);
            }
        }
        Ok(removed)
    }

    /// Record the session's latest navigation target. The first touch
    /// is also where Allocated is observed becoming InUse.
    pub async fn touch(
        &self,
        room_id: &str,
        url: Option<String>,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.active_for_room(room_id).await? else {
            return Ok(None);
        };
        if session.status == SessionStatus::Allocated {
            session.status = SessionStatus::InUse;
        }
        if url.is_some() {
            session.last_url = url;
        }
        self.store.update(session.clone()).await?;
        Ok(Some(session))
    }

    /// Refresh a session's endpoints (after a container restart).
    pub async fn update_connection(
        &self,
        id: SessionId,
        connection: ConnectionInfo,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.store.get(id).await? else {
            return Ok(None);
        };
        session.connection = connection;
        self.store.update(session.clone()).await?;
        Ok(Some(session))
    }
}
