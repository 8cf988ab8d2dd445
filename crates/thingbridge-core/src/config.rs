//! Configuration loading.
//!
//! Sources in priority order: environment variables, then `thingbridge.toml`
//! (or the path given on the command line), then built-in defaults.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    pub const DB_PATH: &str = "data/thingbridge.redb";
    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_CLIENT_ID: &str = "thingbridge-server";
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
    pub const QUEUE_CAPACITY: usize = 10_000;
    pub const DEAD_LETTER_LIMIT: usize = 1_000;
    pub const JOB_ATTEMPTS: u32 = 3;
    pub const JOB_BACKOFF_MS: u64 = 5_000;
    pub const JOB_MAX_BACKOFF_MS: u64 = 60_000;
    pub const POLL_INTERVAL_MS: u64 = 100;
    pub const MAX_CONCURRENT_JOBS: usize = 10;
    pub const CONFIG_FILE: &str = "thingbridge.toml";
}

/// Environment variable names.
pub mod env_vars {
    pub const DB_PATH: &str = "THINGBRIDGE_DB_PATH";
    pub const LOG_JSON: &str = "THINGBRIDGE_LOG_JSON";
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USER: &str = "MQTT_USER";
    pub const MQTT_PASS: &str = "MQTT_PASS";
    pub const MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
    pub const MQTT_HOST_PUBLIC: &str = "MQTT_HOST_PUBLIC";
    pub const MQTT_PORT_PUBLIC: &str = "MQTT_PORT_PUBLIC";
    pub const REFUND_QUOTA_ON_TRANSFER: &str = "REFUND_QUOTA_ON_TRANSFER";
}

/// System configuration row keys kept in the relational store.
pub mod system_keys {
    pub const REFUND_QUOTA_ON_TRANSFER: &str = "REFUND_QUOTA_ON_TRANSFER";
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_USER: &str = "MQTT_USER";
    pub const MQTT_PASS: &str = "MQTT_PASS";
}

/// What happens to the old tenant's quota when hardware is transferred away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaRefundPolicy {
    /// Decrement the previous (tenant, model) activated count.
    Refund,
    /// The previous tenant's licence stays consumed.
    #[default]
    NoRefund,
}

impl QuotaRefundPolicy {
    pub fn from_flag(flag: bool) -> Self {
        if flag {
            QuotaRefundPolicy::Refund
        } else {
            QuotaRefundPolicy::NoRefund
        }
    }

    pub fn refunds(&self) -> bool {
        matches!(self, QuotaRefundPolicy::Refund)
    }
}

impl FromStr for QuotaRefundPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "refund" => Ok(QuotaRefundPolicy::Refund),
            "false" | "0" | "no" | "no_refund" => Ok(QuotaRefundPolicy::NoRefund),
            other => Err(Error::config(format!("invalid refund policy: {other}"))),
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, or `:memory:` for a throwaway file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    defaults::DB_PATH.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Broker connection used by the server, plus the address handed to devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Broker host devices should connect to, if different from `host`.
    #[serde(default)]
    pub public_host: Option<String>,
    /// Broker port devices should connect to, if different from `port`.
    #[serde(default)]
    pub public_port: Option<u16>,
}

fn default_mqtt_host() -> String {
    defaults::MQTT_HOST.to_string()
}

fn default_mqtt_port() -> u16 {
    defaults::MQTT_PORT
}

fn default_client_id() -> String {
    defaults::MQTT_CLIENT_ID.to_string()
}

fn default_keep_alive() -> u64 {
    defaults::MQTT_KEEP_ALIVE_SECS
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            public_host: None,
            public_port: None,
        }
    }
}

impl MqttConfig {
    pub fn device_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.host)
    }

    pub fn device_port(&self) -> u16 {
        self.public_port.unwrap_or(self.port)
    }
}

/// Provisioning behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub refund_on_transfer: QuotaRefundPolicy,
}

/// Work queue defaults for control jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Dead letters kept in memory; the oldest is evicted first.
    #[serde(default = "default_dead_letter_limit")]
    pub dead_letter_limit: usize,
}

fn default_capacity() -> usize {
    defaults::QUEUE_CAPACITY
}

fn default_attempts() -> u32 {
    defaults::JOB_ATTEMPTS
}

fn default_backoff() -> u64 {
    defaults::JOB_BACKOFF_MS
}

fn default_max_backoff() -> u64 {
    defaults::JOB_MAX_BACKOFF_MS
}

fn default_dead_letter_limit() -> usize {
    defaults::DEAD_LETTER_LIMIT
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            attempts: default_attempts(),
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
            dead_letter_limit: default_dead_letter_limit(),
        }
    }
}

/// Job processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_poll_interval() -> u64 {
    defaults::POLL_INTERVAL_MS
}

fn default_max_concurrent() -> usize {
    defaults::MAX_CONCURRENT_JOBS
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Shadow/status store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Expiry for `status:<token>` keys. `None` keeps them until overwritten.
    #[serde(default)]
    pub status_ttl_secs: Option<u64>,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(defaults::CONFIG_FILE));
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_toml(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(category = "config", "No config file, using defaults and environment");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(env_vars::DB_PATH) {
            self.storage.path = path;
        }

        if let Some(host) = lookup(env_vars::MQTT_HOST).or_else(|| lookup(env_vars::MQTT_HOST_PUBLIC)) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT).and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(user) = lookup(env_vars::MQTT_USER) {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = lookup(env_vars::MQTT_PASS) {
            self.mqtt.password = Some(pass);
        }
        if let Some(client_id) = lookup(env_vars::MQTT_CLIENT_ID) {
            self.mqtt.client_id = client_id;
        }
        if let Some(host) = lookup(env_vars::MQTT_HOST_PUBLIC) {
            self.mqtt.public_host = Some(host);
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT_PUBLIC).and_then(|s| s.parse().ok()) {
            self.mqtt.public_port = Some(port);
        }

        if let Some(policy) = lookup(env_vars::REFUND_QUOTA_ON_TRANSFER).and_then(|s| s.parse().ok()) {
            self.provisioning.refund_on_transfer = policy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.storage.path, "data/thingbridge.redb");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.queue.attempts, 3);
        assert_eq!(config.queue.backoff_ms, 5000);
        assert_eq!(config.provisioning.refund_on_transfer, QuotaRefundPolicy::NoRefund);
        assert!(config.state.status_ttl_secs.is_none());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml(
            r#"
            [mqtt]
            host = "broker.local"
            public_host = "mqtt.example.com"

            [provisioning]
            refund_on_transfer = "refund"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.device_host(), "mqtt.example.com");
        assert!(config.provisioning.refund_on_transfer.refunds());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST_PUBLIC", "public.example.com"),
            ("MQTT_PORT", "8883"),
            ("REFUND_QUOTA_ON_TRANSFER", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        // MQTT_HOST unset falls back to the public host
        assert_eq!(config.mqtt.host, "public.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.device_port(), 8883);
        assert_eq!(config.provisioning.refund_on_transfer, QuotaRefundPolicy::Refund);
    }

    #[test]
    fn test_refund_policy_parse() {
        assert_eq!("TRUE".parse::<QuotaRefundPolicy>().unwrap(), QuotaRefundPolicy::Refund);
        assert_eq!("false".parse::<QuotaRefundPolicy>().unwrap(), QuotaRefundPolicy::NoRefund);
        assert!("maybe".parse::<QuotaRefundPolicy>().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.queue.capacity, 10_000);
    }
}
