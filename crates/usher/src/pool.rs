//! Slot pool: the fixed set of container-backed browser slots.
//!
//! Slot health is a pool-level property. An Unhealthy slot is out of
//! rotation: it is never handed out, and returning it is a no-op.
//! Capacity degrades instead of failing the pool, except when zero
//! slots provision at startup.

use std::sync::Mutex;

use serde::Serialize;

use crate::driver::{ConnectionInfo, DriverError, RuntimeDriver, SlotIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotHealth {
    /// Container not started yet.
    Provisioning,
    /// In rotation, free to allocate.
    Available,
    /// Bound to an active session.
    Allocated,
    /// Removed from rotation after a provisioning or probe failure.
    Unhealthy,
}

#[derive(Debug, Clone)]
struct Slot {
    health: SlotHealth,
    connection: Option<ConnectionInfo>,
}

/// A slot handed out by [`SlotPool::allocate`]. Available slots always
/// carry endpoints, so the connection here is not optional.
#[derive(Debug, Clone)]
pub struct AllocatedSlot {
    pub index: SlotIndex,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Configured slot count, healthy or not.
    pub total: usize,
    pub available: usize,
    pub allocated: usize,
    pub unhealthy: usize,
    pub allocated_indices: Vec<SlotIndex>,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no slots could be provisioned")]
    NoSlotsProvisioned,
}

pub struct SlotPool {
    slots: Mutex<Vec<Slot>>,
}

impl SlotPool {
    pub fn new(num_slots: usize) -> Self {
        let slots = (0..num_slots)
            .map(|_| Slot {
                health: SlotHealth::Provisioning,
                connection: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Provision every slot through the driver. Per-slot failures mark
    /// that slot Unhealthy and continue; the pool only fails when no
    /// slot provisions at all.
    ///
    /// Returns the number of slots that made it into rotation.
    pub async fn initialize(&self, driver: &dyn RuntimeDriver) -> Result<usize, PoolError> {
        let num_slots = self.slots().len();

        if let Err(e) = driver.initialize().await {
            tracing::error!(error = %e, "Runtime initialization failed");
            return Err(PoolError::NoSlotsProvisioned);
        }

        let mut provisioned = 0;
        for index in 0..num_slots {
            match driver.provision_slot(index).await {
                Ok(connection) => {
                    let mut slots = self.slots();
                    slots[index].health = SlotHealth::Available;
                    slots[index].connection = Some(connection);
                    provisioned += 1;
                    tracing::debug!(slot = index, "Slot provisioned");
                }
                Err(e) => {
                    self.slots()[index].health = SlotHealth::Unhealthy;
                    tracing::warn!(slot = index, error = %e, "Slot provisioning failed - capacity reduced");
                }
            }
        }

        if provisioned == 0 {
            return Err(PoolError::NoSlotsProvisioned);
        }

        tracing::info!(provisioned, total = num_slots, "Slot pool ready");
        Ok(provisioned)
    }

    /// Take the lowest-index Available slot, or `None` when the pool is
    /// exhausted. Atomic with respect to concurrent callers.
    pub fn allocate(&self) -> Option<AllocatedSlot> {
        let mut slots = self.slots();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.health != SlotHealth::Available {
                continue;
            }
            let Some(connection) = slot.connection.clone() else {
                tracing::error!(slot = index, "Available slot has no endpoints - marking unhealthy");
                slot.health = SlotHealth::Unhealthy;
                continue;
            };
            slot.health = SlotHealth::Allocated;
            return Some(AllocatedSlot { index, connection });
        }
        None
    }

    /// Return a slot to rotation. Idempotent: returning an
    /// already-Available slot is a logged no-op, and Unhealthy slots
    /// stay out of rotation.
    pub fn release(&self, index: SlotIndex) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(index) else {
            tracing::warn!(slot = index, "Attempted to return unknown slot");
            return;
        };
        match slot.health {
            SlotHealth::Allocated => {
                slot.health = SlotHealth::Available;
                tracing::debug!(slot = index, "Slot returned to rotation");
            }
            SlotHealth::Available => {
                tracing::debug!(slot = index, "Slot already available - return is a no-op");
            }
            SlotHealth::Unhealthy | SlotHealth::Provisioning => {
                tracing::warn!(slot = index, health = ?slot.health, "Slot not in rotation - return ignored");
            }
        }
    }

    /// Pull a slot out of rotation permanently (until re-provisioned).
    pub fn mark_unhealthy(&self, index: SlotIndex) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(index) {
            if slot.health != SlotHealth::Unhealthy {
                slot.health = SlotHealth::Unhealthy;
                tracing::warn!(slot = index, "Slot marked unhealthy - capacity reduced");
            }
        } else {
            tracing::warn!(slot = index, "Attempted to mark unknown slot unhealthy");
        }
    }

    /// Refresh a slot's endpoints (after a container restart).
    pub fn set_connection(&self, index: SlotIndex, connection: ConnectionInfo) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(index) {
            slot.connection = Some(connection);
        }
    }

    pub fn available(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| s.health == SlotHealth::Available)
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots();
        let mut stats = PoolStats {
            total: slots.len(),
            available: 0,
            allocated: 0,
            unhealthy: 0,
            allocated_indices: Vec::new(),
        };
        for (index, slot) in slots.iter().enumerate() {
            match slot.health {
                SlotHealth::Available => stats.available += 1,
                SlotHealth::Allocated => {
                    stats.allocated += 1;
                    stats.allocated_indices.push(index);
                }
                SlotHealth::Unhealthy => stats.unhealthy += 1,
                SlotHealth::Provisioning => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Driver whose listed slots fail to provision.
    struct FlakyDriver {
        failing: HashSet<SlotIndex>,
        provisioned: AtomicUsize,
    }

    impl FlakyDriver {
        fn new(failing: impl IntoIterator<Item = SlotIndex>) -> Self {
            Self {
                failing: failing.into_iter().collect(),
                provisioned: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RuntimeDriver for FlakyDriver {
        async fn initialize(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn provision_slot(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError> {
            if self.failing.contains(&index) {
                return Err(DriverError::Slot(index, "container exited".to_string()));
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(ConnectionInfo::new(format!("wss://slot-{index}.internal")))
        }

        async fn release_slot(&self, _index: SlotIndex) -> Result<(), DriverError> {
            Ok(())
        }

        async fn health_check(&self, _index: SlotIndex) -> bool {
            true
        }

        async fn list_running(&self) -> HashSet<SlotIndex> {
            HashSet::new()
        }

        async fn restart_process(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError> {
            Ok(ConnectionInfo::new(format!("wss://slot-{index}.internal")))
        }
    }

    #[tokio::test]
    async fn initialize_provisions_all_slots() {
        let pool = SlotPool::new(3);
        let driver = FlakyDriver::new([]);

        let provisioned = pool.initialize(&driver).await.unwrap();
        assert_eq!(provisioned, 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn partial_failure_degrades_capacity() {
        let pool = SlotPool::new(3);
        let driver = FlakyDriver::new([1]);

        let provisioned = pool.initialize(&driver).await.unwrap();
        assert_eq!(provisioned, 2);

        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.unhealthy, 1);
    }

    #[tokio::test]
    async fn total_failure_is_fatal() {
        let pool = SlotPool::new(2);
        let driver = FlakyDriver::new([0, 1]);

        let result = pool.initialize(&driver).await;
        assert!(matches!(result, Err(PoolError::NoSlotsProvisioned)));
    }

    #[tokio::test]
    async fn allocate_prefers_lowest_index() {
        let pool = SlotPool::new(3);
        pool.initialize(&FlakyDriver::new([])).await.unwrap();

        let first = pool.allocate().unwrap();
        assert_eq!(first.index, 0);

        let second = pool.allocate().unwrap();
        assert_eq!(second.index, 1);

        pool.release(0);
        // Slot 0 freed up, so it wins over slot 2.
        let third = pool.allocate().unwrap();
        assert_eq!(third.index, 0);
    }

    #[tokio::test]
    async fn allocate_skips_unhealthy_slots() {
        let pool = SlotPool::new(2);
        pool.initialize(&FlakyDriver::new([0])).await.unwrap();

        let slot = pool.allocate().unwrap();
        assert_eq!(slot.index, 1);
        assert!(pool.allocate().is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = SlotPool::new(1);
        pool.initialize(&FlakyDriver::new([])).await.unwrap();

        let slot = pool.allocate().unwrap();
        pool.release(slot.index);
        pool.release(slot.index);

        assert_eq!(pool.available(), 1);
        let stats = pool.stats();
        assert_eq!(stats.available + stats.allocated + stats.unhealthy, stats.total);
    }

    #[tokio::test]
    async fn release_does_not_resurrect_unhealthy_slot() {
        let pool = SlotPool::new(1);
        pool.initialize(&FlakyDriver::new([])).await.unwrap();

        let slot = pool.allocate().unwrap();
        pool.mark_unhealthy(slot.index);
        pool.release(slot.index);

        assert_eq!(pool.available(), 0);
        assert!(pool.allocate().is_none());
    }

    #[tokio::test]
    async fn stats_account_for_every_slot() {
        let pool = SlotPool::new(4);
        pool.initialize(&FlakyDriver::new([3])).await.unwrap();

        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.allocated_indices, vec![0, 1]);
        assert_eq!(stats.available + stats.allocated + stats.unhealthy, stats.total);
    }
}
