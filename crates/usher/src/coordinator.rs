//! Lifecycle coordinator - the single admission decision point.
//!
//! Every state-changing sequence (allocate, release, offer handling,
//! sweeps) runs inside one admission section, so exactly one allocation
//! decision is in flight at a time and pool, queue, and registry never
//! disagree about who owns a slot. Acquisition is try-with-timeout: on
//! contention the invocation is skipped, not blocked - explicit calls
//! surface `Contended` to the caller, the maintenance sweep just waits
//! for its next tick.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::PoolConfig;
use crate::cooldown::CooldownTracker;
use crate::driver::{DriverError, RuntimeDriver, SlotIndex};
use crate::notify::{EventSink, SessionEvent};
use crate::pool::{PoolError, PoolStats, SlotPool};
use crate::queue::{AdmissionQueue, QueueStatus};
use crate::registry::{
    MemoryStore, Session, SessionRegistry, SessionStatus, SessionStore, StoreError,
};

/// Coarse classification of a failure, for the thin API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller error: cooldown active, nothing to act on.
    Validation,
    /// Driver or store unavailable; safe to retry later.
    TransientInfra,
    /// A racing call got there first; absorbed, not escalated.
    ConcurrencyConflict,
    /// Unrecoverable: the pool never came up.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("cooldown active, retry in {0:?}")]
    Cooldown(Duration),
    #[error("no active session")]
    NotFound,
    #[error("no offer pending")]
    OfferNotPending,
    #[error("no slot available")]
    NoSlotAvailable,
    #[error("admission section busy")]
    Contended,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cooldown(_) | Self::NotFound | Self::OfferNotPending => ErrorKind::Validation,
            Self::NoSlotAvailable | Self::Contended => ErrorKind::ConcurrencyConflict,
            Self::Driver(_) | Self::Store(_) => ErrorKind::TransientInfra,
            Self::Pool(_) => ErrorKind::Fatal,
        }
    }
}

/// Outcome of `request_session`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Allocated { session: Session },
    AlreadyAllocated { session: Session },
    Queued { queue: QueueStatus },
    AlreadyQueued { queue: QueueStatus },
}

/// A slot released but not yet returned to rotation (grace delay).
#[derive(Debug, Clone, Copy)]
struct PendingReturn {
    slot_index: SlotIndex,
    due_at: DateTime<Utc>,
}

pub struct LifecycleCoordinator {
    config: PoolConfig,
    driver: Arc<dyn RuntimeDriver>,
    sink: Arc<dyn EventSink>,
    pool: SlotPool,
    queue: AdmissionQueue,
    registry: SessionRegistry,
    cooldowns: CooldownTracker,
    admission: tokio::sync::Mutex<()>,
    pending_returns: StdMutex<Vec<PendingReturn>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LifecycleCoordinator {
    pub fn new(config: PoolConfig, driver: Arc<dyn RuntimeDriver>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_store(config, driver, sink, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        config: PoolConfig,
        driver: Arc<dyn RuntimeDriver>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            pool: SlotPool::new(config.num_slots),
            queue: AdmissionQueue::new(config.offer_window),
            registry: SessionRegistry::new(store),
            cooldowns: CooldownTracker::new(config.cooldown),
            config,
            driver,
            sink,
            admission: tokio::sync::Mutex::new(()),
            pending_returns: StdMutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Provision the pool, then reconcile the registry against what the
    /// runtime actually has running. Fails only when zero slots come up.
    pub async fn initialize(&self) -> Result<usize, CoordinatorError> {
        let provisioned = self.pool.initialize(self.driver.as_ref()).await?;

        let running = self.driver.list_running().await;
        let removed = self.registry.reconcile_orphans(&running).await?;
        if !removed.is_empty() {
            tracing::warn!(count = removed.len(), "Reconciled orphaned sessions at startup");
        }

        Ok(provisioned)
    }

    async fn admission_guard(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, CoordinatorError> {
        tokio::time::timeout(self.config.admission_timeout, self.admission.lock())
            .await
            .map_err(|_| CoordinatorError::Contended)
    }

    /// Request a session for `room_id`.
    ///
    /// Idempotent for rooms that already hold a session or a queue
    /// entry. New requests either allocate immediately or join the
    /// queue: any Waiting entry ahead of the caller, or an empty pool,
    /// means the caller waits its turn.
    pub async fn request_session(&self, room_id: &str) -> Result<RequestOutcome, CoordinatorError> {
        let _guard = self.admission_guard().await?;
        let now = Utc::now();

        if let Some(remaining) = self.cooldowns.remaining(room_id, now) {
            tracing::debug!(room = %room_id, remaining = ?remaining, "Request refused - cooldown active");
            return Err(CoordinatorError::Cooldown(remaining));
        }

        if let Some(session) = self.registry.active_for_room(room_id).await? {
            tracing::debug!(room = %room_id, session = %session.id, "Room already holds a session");
            return Ok(RequestOutcome::AlreadyAllocated { session });
        }

        if let Some(queue) = self.queue.status_of(room_id) {
            tracing::debug!(room = %room_id, position = queue.position, "Room already queued");
            return Ok(RequestOutcome::AlreadyQueued { queue });
        }

        if self.queue.waiting_count() > 0 || self.pool.available() == 0 {
            let queue = self.queue.enqueue(room_id, now);
            self.sink.emit(SessionEvent::Queued {
                room_id: room_id.to_string(),
                status: queue.clone(),
            });
            return Ok(RequestOutcome::Queued { queue });
        }

        let session = self.allocate_locked(room_id, now).await?;
        Ok(RequestOutcome::Allocated { session })
    }

    /// Allocate a slot and create the session record. Must be called
    /// with the admission guard held.
    async fn allocate_locked(
        &self,
        room_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, CoordinatorError> {
        let slot = self.pool.allocate().ok_or(CoordinatorError::NoSlotAvailable)?;

        match self
            .registry
            .create(room_id, slot.index, slot.connection, self.config.session_ttl, now)
            .await
        {
            Ok(session) => {
                self.sink.emit(SessionEvent::Allocated {
                    room_id: room_id.to_string(),
                    session: session.clone(),
                });
                self.sink.emit(SessionEvent::PlaybackReset {
                    room_id: room_id.to_string(),
                });
                Ok(session)
            }
            Err(e) => {
                // Persistence failure aborts the operation; the slot
                // must not leak out of rotation.
                self.pool.release(slot.index);
                Err(e.into())
            }
        }
    }

    /// Release `room_id`'s session. The slot returns to rotation after
    /// the grace delay, then the queue drains once.
    pub async fn release_session(self: &Arc<Self>, room_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.admission_guard().await?;
        let now = Utc::now();

        let Some(session) = self.registry.active_for_room(room_id).await? else {
            return Err(CoordinatorError::NotFound);
        };

        self.registry
            .delete(session.id, SessionStatus::Deallocated, now)
            .await?;
        self.cooldowns.mark(room_id, now);
        self.sink.emit(SessionEvent::Released {
            room_id: room_id.to_string(),
        });

        self.schedule_slot_return(session.slot_index, now);
        Ok(())
    }

    /// Record a grace-delayed slot return and spawn its flush. The
    /// maintenance sweep also flushes, so a lost task is repaired on
    /// the next tick rather than leaking the slot.
    fn schedule_slot_return(self: &Arc<Self>, slot_index: SlotIndex, now: DateTime<Utc>) {
        let grace = self.config.release_grace;
        let due_at = now
            + chrono::TimeDelta::from_std(grace).unwrap_or(chrono::TimeDelta::zero());

        self.pending_returns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(PendingReturn { slot_index, due_at });

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = coordinator.flush_pending_returns().await {
                tracing::warn!(slot = slot_index, error = %e, "Deferred slot return skipped - sweep will retry");
            }
        });
    }

    /// Return every due slot to rotation and drain once if any came
    /// back. Idempotent; called from the grace task and the sweep.
    pub async fn flush_pending_returns(&self) -> Result<usize, CoordinatorError> {
        let _guard = self.admission_guard().await?;
        let now = Utc::now();

        let due: Vec<PendingReturn> = {
            let mut pending = self
                .pending_returns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let (ready, later): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.due_at <= now);
            *pending = later;
            ready
        };

        for entry in &due {
            self.pool.release(entry.slot_index);
        }
        if !due.is_empty() {
            self.drain_locked(now);
        }
        Ok(due.len())
    }

    /// Offer the oldest Waiting entry a freed slot. One offer per
    /// invocation; single-flight via the admission guard.
    pub async fn drain_queue(&self) -> Result<bool, CoordinatorError> {
        let _guard = self.admission_guard().await?;
        Ok(self.drain_locked(Utc::now()))
    }

    fn drain_locked(&self, now: DateTime<Utc>) -> bool {
        if self.pool.available() == 0 {
            return false;
        }
        let Some(next) = self.queue.peek_next_waiting() else {
            return false;
        };
        let Some(status) = self.queue.notify(&next.room_id, now) else {
            // Entry mutated between peek and notify; the next drain
            // will pick up whoever is oldest now.
            tracing::debug!(room = %next.room_id, "Drain lost a race on notify");
            return false;
        };
        tracing::info!(room = %next.room_id, deadline = ?status.deadline, "Offer extended");
        self.sink.emit(SessionEvent::OfferAvailable {
            room_id: next.room_id.clone(),
            status,
        });
        true
    }

    /// Claim a pending offer. The offer must still be within its
    /// deadline, and the slot must still be free - a racing allocation
    /// fails the accept and the queue re-drains.
    pub async fn accept_offer(&self, room_id: &str) -> Result<Session, CoordinatorError> {
        let _guard = self.admission_guard().await?;
        let now = Utc::now();

        if !self.queue.accept(room_id, now) {
            return Err(CoordinatorError::OfferNotPending);
        }

        match self.allocate_locked(room_id, now).await {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::warn!(room = %room_id, error = %e, "Accepted offer lost its slot - re-draining");
                self.drain_locked(now);
                Err(e)
            }
        }
    }

    /// Turn down a pending offer and pass the slot to the next waiter.
    pub async fn decline_offer(&self, room_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.admission_guard().await?;

        if !self.queue.decline(room_id) {
            return Err(CoordinatorError::OfferNotPending);
        }
        self.sink.emit(SessionEvent::QueueCancelled {
            room_id: room_id.to_string(),
        });
        self.drain_locked(Utc::now());
        Ok(())
    }

    /// Caller-initiated withdrawal from the queue, any state.
    pub async fn cancel_queue(&self, room_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.admission_guard().await?;

        if !self.queue.cancel(room_id) {
            return Err(CoordinatorError::NotFound);
        }
        self.sink.emit(SessionEvent::QueueCancelled {
            room_id: room_id.to_string(),
        });
        self.drain_locked(Utc::now());
        Ok(())
    }

    /// Reap sessions whose TTL elapsed: delete the record, return the
    /// slot, notify, and drain once for the whole batch.
    pub async fn sweep_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, CoordinatorError> {
        let _guard = self.admission_guard().await?;

        let expired = self.registry.list_expired(now).await?;
        let count = expired.len();
        for session in expired {
            self.registry
                .delete(session.id, SessionStatus::Expired, now)
                .await?;
            self.pool.release(session.slot_index);
            self.sink.emit(SessionEvent::Expired {
                room_id: session.room_id.clone(),
            });
            tracing::info!(room = %session.room_id, slot = session.slot_index, "Session expired");
        }

        if count > 0 {
            self.drain_locked(now);
        }
        Ok(count)
    }

    /// Drop offers past their deadline; if anything expired and a slot
    /// is free, the next waiter gets its offer immediately.
    pub async fn sweep_expired_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, CoordinatorError> {
        let _guard = self.admission_guard().await?;

        let expired = self.queue.sweep_expired_offers(now);
        for room_id in &expired {
            self.sink.emit(SessionEvent::OfferExpired {
                room_id: room_id.clone(),
            });
        }

        if !expired.is_empty() && self.pool.available() > 0 {
            self.drain_locked(now);
        }
        Ok(expired.len())
    }

    /// Probe the slots behind active sessions. A failed probe ends the
    /// session with `Error` and pulls the slot from rotation.
    pub async fn sweep_unhealthy_sessions(&self) -> Result<usize, CoordinatorError> {
        let _guard = self.admission_guard().await?;
        let now = Utc::now();

        let mut failed = 0;
        for session in self.registry.list_all().await? {
            if !session.status.is_active() {
                continue;
            }
            if self.driver.health_check(session.slot_index).await {
                continue;
            }
            tracing::warn!(
                room = %session.room_id,
                slot = session.slot_index,
                "Health probe failed - ending session"
            );
            self.registry
                .delete(session.id, SessionStatus::Error, now)
                .await?;
            self.pool.mark_unhealthy(session.slot_index);
            self.sink.emit(SessionEvent::SessionFailed {
                room_id: session.room_id.clone(),
                reason: "browser container unhealthy".to_string(),
            });
            failed += 1;
        }
        Ok(failed)
    }

    /// Restart the container behind `room_id`'s session and refresh its
    /// endpoints.
    pub async fn restart_session(&self, room_id: &str) -> Result<Session, CoordinatorError> {
        let Some(session) = self.registry.active_for_room(room_id).await? else {
            return Err(CoordinatorError::NotFound);
        };

        let connection = self.driver.restart_process(session.slot_index).await?;
        self.pool.set_connection(session.slot_index, connection.clone());
        let updated = self
            .registry
            .update_connection(session.id, connection)
            .await?
            .unwrap_or(session);
        tracing::info!(room = %room_id, slot = updated.slot_index, "Session process restarted");
        Ok(updated)
    }

    /// Record the session's latest navigation target.
    pub async fn touch_session(
        &self,
        room_id: &str,
        url: Option<String>,
    ) -> Result<Session, CoordinatorError> {
        self.registry
            .touch(room_id, url)
            .await?
            .ok_or(CoordinatorError::NotFound)
    }

    pub async fn session_status(&self, room_id: &str) -> Result<Option<Session>, CoordinatorError> {
        Ok(self.registry.active_for_room(room_id).await?)
    }

    pub fn queue_status(&self, room_id: &str) -> Option<QueueStatus> {
        self.queue.status_of(room_id)
    }

    pub fn cooldown_status(&self, room_id: &str) -> Option<Duration> {
        self.cooldowns.remaining(room_id, Utc::now())
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, CoordinatorError> {
        Ok(self.registry.list_all().await?)
    }

    pub fn list_queue(&self) -> Vec<QueueStatus> {
        self.queue.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Tear down every live session and container. Blocks on the
    /// admission section - shutdown can afford to wait.
    pub async fn shutdown(&self) {
        let _guard = self.admission.lock().await;
        let now = Utc::now();

        match self.registry.list_all().await {
            Ok(sessions) => {
                for session in sessions {
                    if let Err(e) = self
                        .registry
                        .delete(session.id, SessionStatus::Deallocated, now)
                        .await
                    {
                        tracing::warn!(session = %session.id, error = %e, "Failed to delete session during shutdown");
                    }
                    self.sink.emit(SessionEvent::Released {
                        room_id: session.room_id.clone(),
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list sessions during shutdown"),
        }

        for index in 0..self.config.num_slots {
            if let Err(e) = self.driver.release_slot(index).await {
                tracing::warn!(slot = index, error = %e, "Failed to release slot during shutdown");
            }
        }
        tracing::info!("Coordinator shut down");
    }

    #[cfg(test)]
    pub(crate) async fn hold_admission(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.admission.lock().await
    }
}
