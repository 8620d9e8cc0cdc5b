//! Admission queue: FIFO waitlist with time-boxed acceptance offers.
//!
//! Entries live in enqueue order; a room's position is derived from how
//! many earlier entries are still present, never stored. Offers move an
//! entry Waiting → Notified and stamp a hard deadline; accept succeeds
//! only while the deadline holds.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Waiting,
    Notified,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    room_id: String,
    enqueued_at: DateTime<Utc>,
    state: QueueState,
    notified_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
}

/// Point-in-time view of one entry, for status responses and events.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub room_id: String,
    /// 1-based FIFO position among still-present entries.
    pub position: usize,
    pub state: QueueState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

pub struct AdmissionQueue {
    entries: Mutex<Vec<QueueEntry>>,
    offer_window: TimeDelta,
}

impl AdmissionQueue {
    pub fn new(offer_window: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            offer_window: TimeDelta::from_std(offer_window).unwrap_or(TimeDelta::zero()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn status_at(entries: &[QueueEntry], index: usize) -> QueueStatus {
        let entry = &entries[index];
        QueueStatus {
            room_id: entry.room_id.clone(),
            position: index + 1,
            state: entry.state,
            enqueued_at: entry.enqueued_at,
            notified_at: entry.notified_at,
            deadline: entry.deadline,
        }
    }

    /// Append a Waiting entry for `room_id`, or return the existing
    /// entry's status unchanged when the room is already present.
    pub fn enqueue(&self, room_id: &str, now: DateTime<Utc>) -> QueueStatus {
        let mut entries = self.entries();
        if let Some(index) = entries.iter().position(|e| e.room_id == room_id) {
            tracing::debug!(room = %room_id, position = index + 1, "Room already queued");
            return Self::status_at(&entries, index);
        }

        entries.push(QueueEntry {
            room_id: room_id.to_string(),
            enqueued_at: now,
            state: QueueState::Waiting,
            notified_at: None,
            deadline: None,
        });
        let index = entries.len() - 1;
        tracing::info!(room = %room_id, position = index + 1, "Room queued");
        Self::status_at(&entries, index)
    }

    /// Oldest entry still Waiting, if any.
    pub fn peek_next_waiting(&self) -> Option<QueueStatus> {
        let entries = self.entries();
        entries
            .iter()
            .position(|e| e.state == QueueState::Waiting)
            .map(|index| Self::status_at(&entries, index))
    }

    /// Transition a Waiting entry to Notified and stamp its offer
    /// deadline. Returns the notified status, or `None` when the entry
    /// is absent or not Waiting.
    pub fn notify(&self, room_id: &str, now: DateTime<Utc>) -> Option<QueueStatus> {
        let mut entries = self.entries();
        let index = entries.iter().position(|e| e.room_id == room_id)?;
        if entries[index].state != QueueState::Waiting {
            tracing::warn!(room = %room_id, "Notify on non-Waiting entry ignored");
            return None;
        }
        entries[index].state = QueueState::Notified;
        entries[index].notified_at = Some(now);
        entries[index].deadline = Some(now + self.offer_window);
        Some(Self::status_at(&entries, index))
    }

    /// Claim a pending offer. Succeeds only while the entry is Notified
    /// and `now` is within the deadline; removes the entry on success.
    pub fn accept(&self, room_id: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries();
        let Some(index) = entries.iter().position(|e| e.room_id == room_id) else {
            return false;
        };
        let entry = &entries[index];
        if entry.state != QueueState::Notified {
            return false;
        }
        if entry.deadline.is_some_and(|deadline| now > deadline) {
            tracing::debug!(room = %room_id, "Accept past offer deadline rejected");
            return false;
        }
        entries.remove(index);
        true
    }

    /// Turn down a pending offer. Succeeds only for Notified entries;
    /// removes the entry.
    pub fn decline(&self, room_id: &str) -> bool {
        let mut entries = self.entries();
        let Some(index) = entries.iter().position(|e| e.room_id == room_id) else {
            return false;
        };
        if entries[index].state != QueueState::Notified {
            return false;
        }
        entries.remove(index);
        true
    }

    /// Caller-initiated withdrawal: removes the entry in any state.
    pub fn cancel(&self, room_id: &str) -> bool {
        let mut entries = self.entries();
        let Some(index) = entries.iter().position(|e| e.room_id == room_id) else {
            return false;
        };
        entries.remove(index);
        true
    }

    /// Drop every Notified entry past its deadline; returns the room
    /// ids that were swept so the caller can emit expiry notifications.
    pub fn sweep_expired_offers(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries();
        let mut expired = Vec::new();
        entries.retain(|entry| {
            let past_deadline = entry.state == QueueState::Notified
                && entry.deadline.is_some_and(|deadline| now > deadline);
            if past_deadline {
                expired.push(entry.room_id.clone());
            }
            !past_deadline
        });
        for room_id in &expired {
            tracing::info!(room = %room_id, "Offer expired - entry removed");
        }
        expired
    }

    pub fn status_of(&self, room_id: &str) -> Option<QueueStatus> {
        let entries = self.entries();
        entries
            .iter()
            .position(|e| e.room_id == room_id)
            .map(|index| Self::status_at(&entries, index))
    }

    pub fn waiting_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.state == QueueState::Waiting)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Full queue snapshot in FIFO order.
    pub fn snapshot(&self) -> Vec<QueueStatus> {
        let entries = self.entries();
        (0..entries.len())
            .map(|index| Self::status_at(&entries, index))
            .collect()
    }
}
