//! Maintenance daemon.
//!
//! A background task that drives the coordinator's sweep entry points
//! on a fixed cadence: expired sessions, stale offers, grace-delayed
//! slot returns, optional health probes, and a final re-drain. Every
//! step goes through the admission section, so a tick that lands on a
//! busy coordinator skips and retries next interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{CoordinatorError, LifecycleCoordinator};

pub struct MaintenanceDaemon {
    coordinator: Arc<LifecycleCoordinator>,
    interval: Duration,
    health_probes: bool,
}

impl MaintenanceDaemon {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        let interval = coordinator.config().sweep_interval;
        Self {
            coordinator,
            interval,
            health_probes: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_health_probes(mut self, enabled: bool) -> Self {
        self.health_probes = enabled;
        self
    }

    /// Run until `shutdown` fires. Ticks never overlap: the next sweep
    /// waits for the previous one to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so a fresh
        // daemon does not sweep before anything happened.
        ticker.tick().await;

        tracing::info!(interval = ?self.interval, "Maintenance daemon started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Maintenance daemon stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let now = Utc::now();

        match self.coordinator.sweep_expired_sessions(now).await {
            Ok(0) => {}
            Ok(reaped) => tracing::info!(reaped, "Expired sessions swept"),
            Err(e) => log_sweep_error("session sweep", &e),
        }

        match self.coordinator.sweep_expired_offers(now).await {
            Ok(0) => {}
            Ok(expired) => tracing::info!(expired, "Stale offers swept"),
            Err(e) => log_sweep_error("offer sweep", &e),
        }

        match self.coordinator.flush_pending_returns().await {
            Ok(0) => {}
            Ok(returned) => tracing::info!(returned, "Deferred slot returns flushed"),
            Err(e) => log_sweep_error("slot return flush", &e),
        }

        if self.health_probes {
            match self.coordinator.sweep_unhealthy_sessions().await {
                Ok(0) => {}
                Ok(failed) => tracing::warn!(failed, "Unhealthy sessions ended"),
                Err(e) => log_sweep_error("health sweep", &e),
            }
        }

        // Catch availability that appeared outside the release/sweep
        // paths (e.g. an accept that left spare capacity behind).
        if let Err(e) = self.coordinator.drain_queue().await {
            log_sweep_error("drain", &e);
        }
    }
}

fn log_sweep_error(step: &str, error: &CoordinatorError) {
    match error {
        CoordinatorError::Contended => {
            tracing::debug!(step, "Admission section busy - skipping until next tick");
        }
        other => {
            tracing::warn!(step, error = %other, "Maintenance step failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::config::PoolConfig;
    use crate::driver::{ConnectionInfo, DriverError, RuntimeDriver, SlotIndex};
    use crate::notify::{EventSink, SessionEvent};

    struct StubDriver;

    #[async_trait]
    impl RuntimeDriver for StubDriver {
        async fn initialize(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn provision_slot(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError> {
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

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<SessionEvent>>,
    }

    impl RecordingSink {
        fn count(&self, label: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.label() == label)
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn daemon_reaps_expired_sessions_and_drains() {
        let config = PoolConfig::default()
            .with_num_slots(1)
            .with_session_ttl(Duration::ZERO)
            .with_offer_window(Duration::from_secs(60))
            .with_cooldown(Duration::ZERO)
            .with_release_grace(Duration::ZERO)
            .with_admission_timeout(Duration::from_millis(100));

        let sink = Arc::new(RecordingSink::default());
        let coordinator = Arc::new(LifecycleCoordinator::new(
            config,
            Arc::new(StubDriver),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        ));
        coordinator.initialize().await.unwrap();

        coordinator.request_session("room-a").await.unwrap();
        coordinator.request_session("room-b").await.unwrap();

        let shutdown = CancellationToken::new();
        let daemon = MaintenanceDaemon::new(Arc::clone(&coordinator))
            .with_interval(Duration::from_millis(10))
            .with_health_probes(false);
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        // Give the daemon a few ticks to reap room-a's zero-TTL
        // session and offer the slot to room-b.
        for _ in 0..100 {
            if sink.count("offer_available") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(sink.count("expired"), 1);
        assert!(sink.count("offer_available") >= 1);
        assert!(coordinator.session_status("room-a").await.unwrap().is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn daemon_stops_on_cancellation() {
        let config = PoolConfig::default()
            .with_num_slots(1)
            .with_admission_timeout(Duration::from_millis(100));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            config,
            Arc::new(StubDriver),
            Arc::new(crate::notify::NullSink),
        ));
        coordinator.initialize().await.unwrap();

        let shutdown = CancellationToken::new();
        let daemon =
            MaintenanceDaemon::new(Arc::clone(&coordinator)).with_interval(Duration::from_millis(5));
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("daemon did not stop")
            .unwrap();
    }
}
