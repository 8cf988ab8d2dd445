//! Command system for device control.
//!
//! Provides:
//! - Command payloads and dispatch receipts
//! - The dispatcher: authorization, desired-state write, enqueue
//! - The job processor: driver delivery with retry, last-seen persistence

pub mod command;
pub mod dispatcher;
pub mod processor;

pub use command::{ControlCommand, DispatchReceipt, DispatchStatus};
pub use dispatcher::CommandDispatcher;
pub use processor::{JobOutcome, JobProcessor};
