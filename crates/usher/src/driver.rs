//! Runtime driver contract.
//!
//! The broker never talks to the container runtime directly; everything
//! goes through this trait so the engine can be tested without real
//! containers and so deployments can swap runtimes (local Docker,
//! Kubernetes pods, a remote fleet API).

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stable slot identity: slots are indexed 0..N-1 for the life of the pool.
pub type SlotIndex = usize;

/// Endpoints and credentials for one provisioned browser container.
///
/// The auth token is a session secret: it is handed to the allocated
/// room out-of-band and never serialized into status responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// WebSocket endpoint clients stream frames and input through.
    pub ws_url: String,
    /// Optional operator-facing control endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(skip_serializing, default)]
    pub auth_token: Option<String>,
}

impl ConnectionInfo {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            admin_url: None,
            auth_token: None,
        }
    }

    pub fn with_admin_url(mut self, url: impl Into<String>) -> Self {
        self.admin_url = Some(url.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("slot {0} failed: {1}")]
    Slot(SlotIndex, String),
}

/// Contract to the container runtime backing the slot pool.
///
/// Implementations must be safe to call concurrently; the broker does
/// not serialize driver calls outside the admission section.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// One-time runtime preparation (images, networks). Called once
    /// before any slot is provisioned.
    async fn initialize(&self) -> Result<(), DriverError>;

    /// Start the container backing `index` and return its endpoints.
    async fn provision_slot(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError>;

    /// Tear down the container backing `index`.
    async fn release_slot(&self, index: SlotIndex) -> Result<(), DriverError>;

    /// Probe the container backing `index`. `false` means the container
    /// is unreachable or failing.
    async fn health_check(&self, index: SlotIndex) -> bool;

    /// Indices of containers the runtime currently reports as running.
    async fn list_running(&self) -> HashSet<SlotIndex>;

    /// Restart the container process behind `index`, returning its
    /// refreshed endpoints.
    async fn restart_process(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError>;
}
