//! usher: admission and lifecycle engine for pooled remote browser sessions.

mod cooldown;

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod notify;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod sweeper;
pub mod transport;

pub use config::PoolConfig;
pub use cooldown::CooldownTracker;
pub use coordinator::{CoordinatorError, ErrorKind, LifecycleCoordinator, RequestOutcome};
pub use driver::{ConnectionInfo, DriverError, RuntimeDriver, SlotIndex};
pub use notify::{ChannelSink, EventSink, NullSink, SessionEvent, WebhookSink, WebhookSinkConfig};
pub use pool::{AllocatedSlot, PoolError, PoolStats, SlotHealth, SlotPool};
pub use queue::{AdmissionQueue, QueueState, QueueStatus};
pub use registry::{
    MemoryStore, Session, SessionId, SessionRegistry, SessionStatus, SessionStore, StoreError,
};
pub use sweeper::MaintenanceDaemon;
