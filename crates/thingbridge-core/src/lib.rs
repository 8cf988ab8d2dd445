//! Core types for ThingBridge.
//!
//! Shared by every crate in the workspace: the unified error type,
//! configuration, the state-store and work-queue seams, and the real-time
//! event bus that fans device events out to connected clients.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod queue;
pub mod state;

pub use config::{AppConfig, QuotaRefundPolicy};
pub use error::{Error, Result};
pub use event::{DeviceEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use queue::{
    FailureOutcome, Job, JobKind, JobOptions, JobPriority, MemoryWorkQueue, QueueStats,
    RetryPolicy, WorkQueue,
};
pub use state::{DeviceStatus, StateStore};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::DeviceEvent;
    pub use crate::eventbus::EventBus;
    pub use crate::queue::{Job, JobKind, WorkQueue};
    pub use crate::state::{keys, StateStore};
}
