//! Command data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device identifier.
pub type DeviceId = String;

/// Payload of a `ControlDevice` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    pub device_id: DeviceId,
    pub feature_code: String,
    pub value: serde_json::Value,
}

/// State of an accepted dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Accepted and waiting for the delivery worker
    Queued,
}

/// Returned to the caller once a command is enqueued. Delivery itself is
/// reported later on the device's real-time room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchReceipt {
    pub status: DispatchStatus,
    pub device_id: DeviceId,
    pub feature_code: String,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
}
