//! Broker configuration.
//!
//! Every tunable has a compiled default and a `USHER_*` environment
//! override; tests use the `with_*` setters to shrink windows to zero.

use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of browser slots to provision.
    pub num_slots: usize,
    /// Maximum session lifetime, measured from allocation.
    pub session_ttl: Duration,
    /// How long a notified waiter has to accept its offer.
    pub offer_window: Duration,
    /// Quiet period per room after releasing a session.
    pub cooldown: Duration,
    /// Delay between releasing a session and returning its slot to rotation.
    pub release_grace: Duration,
    /// Cadence of the maintenance sweep.
    pub sweep_interval: Duration,
    /// How long a caller waits for the admission section before skipping.
    pub admission_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_slots: env_u64("USHER_NUM_SLOTS", 4) as usize,
            session_ttl: Duration::from_secs(env_u64("USHER_SESSION_TTL_SECS", 30 * 60)),
            offer_window: Duration::from_secs(env_u64("USHER_OFFER_WINDOW_SECS", 60)),
            cooldown: Duration::from_secs(env_u64("USHER_COOLDOWN_SECS", 120)),
            release_grace: Duration::from_secs(env_u64("USHER_RELEASE_GRACE_SECS", 3)),
            sweep_interval: Duration::from_secs(env_u64("USHER_SWEEP_INTERVAL_SECS", 30)),
            admission_timeout: Duration::from_millis(env_u64("USHER_ADMISSION_TIMEOUT_MS", 250)),
        }
    }
}

impl PoolConfig {
    pub fn with_num_slots(mut self, n: usize) -> Self {
        self.num_slots = n;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_offer_window(mut self, window: Duration) -> Self {
        self.offer_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }
}
