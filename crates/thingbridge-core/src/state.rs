//! Shadow state store abstraction.
//!
//! Online status lives under a scalar key per device token; the shadow is a
//! hash per token whose fields are namespaced `desired:<feature>` (written by
//! the dispatcher) and `reported:<feature>` (written by the reconciler).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key and field naming.
pub mod keys {
    pub const DESIRED_PREFIX: &str = "desired:";
    pub const REPORTED_PREFIX: &str = "reported:";

    /// `status:<token>`
    pub fn status(token: &str) -> String {
        format!("status:{token}")
    }

    /// `shadow:<token>`
    pub fn shadow(token: &str) -> String {
        format!("shadow:{token}")
    }

    /// `desired:<feature>`
    pub fn desired(feature: &str) -> String {
        format!("{DESIRED_PREFIX}{feature}")
    }

    /// `reported:<feature>`
    pub fn reported(feature: &str) -> String {
        format!("{REPORTED_PREFIX}{feature}")
    }

    /// Real-time room for a device, `device_<token>`.
    pub fn room(token: &str) -> String {
        format!("device_{token}")
    }
}

/// Connectivity reported on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceStatus::Online)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(Error::MalformedMessage(format!("unknown status: {other}"))),
        }
    }
}

/// Key-value store with string, hash and TTL semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a scalar key. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a scalar key, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Set several fields of a hash, creating it if needed.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// All fields of a hash; empty when absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Remove fields from a hash. Returns how many were present.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;
}

/// Render a JSON value the way the shadow stores it: strings verbatim,
/// anything else in its JSON text form.
pub fn shadow_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
