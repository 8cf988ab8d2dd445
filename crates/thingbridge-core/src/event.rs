//! Real-time events delivered to clients watching a device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{keys, DeviceStatus};

/// Events fanned out to the `device_<token>` room.
///
/// The serialized `event` tag is the wire name clients listen for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceEvent {
    /// A driver accepted the value for delivery.
    CommandSent {
        device_id: String,
        token: String,
        feature_code: String,
        value: serde_json::Value,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// One delivery attempt failed; the queue may retry.
    CommandError {
        device_id: String,
        token: String,
        feature_code: String,
        error: String,
        attempt: u32,
    },

    /// Delivery gave up after the last attempt.
    CommandFailed {
        device_id: String,
        token: String,
        feature_code: String,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// The device reported new feature values.
    DeviceUpdate {
        token: String,
        data: serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    /// The device came online or went offline.
    StatusChanged {
        token: String,
        status: DeviceStatus,
        timestamp: DateTime<Utc>,
    },
}

impl DeviceEvent {
    pub fn command_sent(
        device_id: impl Into<String>,
        token: impl Into<String>,
        feature_code: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        DeviceEvent::CommandSent {
            device_id: device_id.into(),
            token: token.into(),
            feature_code: feature_code.into(),
            value,
            status: "sent".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::CommandSent { .. } => "COMMAND_SENT",
            DeviceEvent::CommandError { .. } => "COMMAND_ERROR",
            DeviceEvent::CommandFailed { .. } => "COMMAND_FAILED",
            DeviceEvent::DeviceUpdate { .. } => "DEVICE_UPDATE",
            DeviceEvent::StatusChanged { .. } => "STATUS_CHANGED",
        }
    }

    /// Token of the device the event concerns.
    pub fn token(&self) -> &str {
        match self {
            DeviceEvent::CommandSent { token, .. }
            | DeviceEvent::CommandError { token, .. }
            | DeviceEvent::CommandFailed { token, .. }
            | DeviceEvent::DeviceUpdate { token, .. }
            | DeviceEvent::StatusChanged { token, .. } => token,
        }
    }

    /// Room the event is published to.
    pub fn room(&self) -> String {
        keys::room(self.token())
    }

    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            DeviceEvent::CommandSent { .. }
                | DeviceEvent::CommandError { .. }
                | DeviceEvent::CommandFailed { .. }
        )
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Room the event was scoped to
    pub room: String,
    /// Component that published
    pub source: String,
    /// Publish time
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(room: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            room: room.into(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}
