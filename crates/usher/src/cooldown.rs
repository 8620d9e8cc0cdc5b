//! Per-room cooldown throttling.
//!
//! Releasing a session stamps the room; a new request inside the window
//! is refused with the remaining wait. Marks for rooms whose window has
//! elapsed are pruned lazily on query.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

pub struct CooldownTracker {
    window: TimeDelta,
    marks: DashMap<String, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::zero()),
            marks: DashMap::new(),
        }
    }

    /// Stamp the room's last-release time.
    pub fn mark(&self, room_id: &str, now: DateTime<Utc>) {
        if self.window > TimeDelta::zero() {
            self.marks.insert(room_id.to_string(), now);
        }
    }

    /// Remaining quiet time for the room, or `None` when it may request.
    pub fn remaining(&self, room_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let released_at = *self.marks.get(room_id)?;
        let remaining = released_at + self.window - now;
        if remaining <= TimeDelta::zero() {
            self.marks.remove(room_id);
            return None;
        }
        remaining.to_std().ok()
    }

    pub fn clear(&self, room_id: &str) {
        self.marks.remove(room_id);
    }
}
