//! Protocol driver interface.

use async_trait::async_trait;
use serde_json::Value;
use thingbridge_storage::{DeviceFeature, DeviceInstance, FeatureBlueprint, Protocol};

use crate::encoding::normalize_value;
use crate::error::DriverError;

/// Encodes a feature value for one transport protocol and delivers it.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Protocol served by this driver.
    fn protocol(&self) -> Protocol;

    /// Display name for logs.
    fn name(&self) -> &str;

    /// Deliver `value` for `feature` to the device.
    ///
    /// `feature` is the model's blueprint entry, which carries the
    /// transport encoding.
    async fn set_value(
        &self,
        device: &DeviceInstance,
        feature: &FeatureBlueprint,
        value: &Value,
    ) -> Result<(), DriverError>;

    /// Convert a value reported by the device into its shadow form.
    fn normalize(&self, feature: &DeviceFeature, raw: &Value) -> String {
        normalize_value(feature.feature_type, raw)
    }
}
