//! Command dispatcher.
//!
//! Turns a user's control intent into a queued delivery job. Every check
//! runs before the first write, so a rejected dispatch leaves no trace in
//! the shadow or the queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thingbridge_core::config::QueueConfig;
use thingbridge_core::state::keys;
use thingbridge_core::{
    DeviceStatus, Error, Job, JobKind, JobOptions, JobPriority, Result, RetryPolicy, StateStore,
    WorkQueue,
};
use thingbridge_devices::DriverRegistry;
use thingbridge_storage::{DeviceInstance, LicenseStore};
use tracing::{debug, info};

use crate::command::{ControlCommand, DispatchReceipt, DispatchStatus};

/// Accepts control intents for devices.
pub struct CommandDispatcher {
    store: Arc<LicenseStore>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn WorkQueue>,
    drivers: Arc<DriverRegistry>,
    retry: RetryPolicy,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<LicenseStore>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        let defaults = QueueConfig::default();
        Self {
            store,
            state,
            queue,
            drivers,
            retry: RetryPolicy::new(defaults.attempts, defaults.backoff_ms, defaults.max_backoff_ms),
        }
    }

    /// Retry policy attached to every control job.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Queue `value` for `feature_code` on a device the caller owns.
    ///
    /// Fails with `Unauthorized` when the device is missing or owned by
    /// someone else, `NotFound`/`Validation` for an unknown or read-only
    /// feature and `DeviceOffline` unless the device reports `online`.
    pub async fn dispatch(
        &self,
        device_id: &str,
        caller_owner_id: &str,
        feature_code: &str,
        value: Value,
    ) -> Result<DispatchReceipt> {
        if device_id.trim().is_empty() || feature_code.trim().is_empty() {
            return Err(Error::validation("device id and feature code are required"));
        }

        let device = self.authorized_device(device_id, caller_owner_id).await?;

        let feature = device.feature(feature_code).ok_or_else(|| {
            Error::not_found(format!("feature {feature_code} on device {device_id}"))
        })?;
        if feature.read_only {
            return Err(Error::validation(format!("feature {feature_code} is read-only")));
        }

        let status = self.state.get(&keys::status(&device.token)).await?;
        if status.as_deref() != Some(DeviceStatus::Online.as_str()) {
            debug!(device_id, status = ?status, "Dispatch refused, device not online");
            return Err(Error::DeviceOffline(device_id.to_string()));
        }

        // Same canonical form the reconciler writes for reported values
        let desired = self.drivers.resolve(device.protocol).normalize(feature, &value);
        self.state
            .hset(&keys::shadow(&device.token), &[(keys::desired(feature_code), desired)])
            .await?;

        let command = ControlCommand {
            device_id: device.id.clone(),
            feature_code: feature_code.to_string(),
            value,
        };
        let options = JobOptions::default()
            .with_priority(JobPriority::High)
            .with_retry(self.retry.clone());
        let job_id = self
            .queue
            .enqueue(Job::from_payload(JobKind::ControlDevice, &command, options)?)
            .await?;

        info!(
            category = "commands",
            device_id = %device.id,
            feature = feature_code,
            job_id = %job_id,
            "Command queued"
        );

        Ok(DispatchReceipt {
            status: DispatchStatus::Queued,
            device_id: device.id,
            feature_code: command.feature_code,
            job_id,
            timestamp: Utc::now(),
        })
    }

    /// Whether `owner_id` owns the device. A missing device is not owned.
    pub async fn check_ownership(&self, device_id: &str, owner_id: &str) -> Result<bool> {
        let id = device_id.to_string();
        let device = self.store.blocking(move |store| store.device(&id)).await?;
        Ok(device.is_some_and(|d| d.is_owned_by(owner_id)))
    }

    /// Raw shadow hash for a token: `desired:*` and `reported:*` fields.
    pub async fn get_shadow(&self, token: &str) -> Result<HashMap<String, String>> {
        self.state.hgetall(&keys::shadow(token)).await
    }

    async fn authorized_device(&self, device_id: &str, owner_id: &str) -> Result<DeviceInstance> {
        let id = device_id.to_string();
        let device = self.store.blocking(move |store| store.device(&id)).await?;
        match device {
            Some(device) if device.is_owned_by(owner_id) => Ok(device),
            // Same answer for "missing" and "not yours"
            _ => Err(Error::unauthorized(format!(
                "device {device_id} is not accessible to {owner_id}"
            ))),
        }
    }
}
