use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thingbridge_storage::{DeviceInstance, FeatureBlueprint, Protocol};
use tracing::debug;

use super::to_bytes;
use crate::driver::DeviceDriver;
use crate::encoding::{render_payload, render_topic};
use crate::error::DriverError;
use crate::transport::MessageTransport;

/// Driver for Zigbee devices bridged onto the broker by a gateway.
///
/// Gateways expect their own JSON, so every feature needs a blueprint
/// encoding.
#[derive(Clone)]
pub struct ZigbeeDriver {
    transport: Arc<dyn MessageTransport>,
}

impl ZigbeeDriver {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DeviceDriver for ZigbeeDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Zigbee
    }

    fn name(&self) -> &str {
        "Generic Zigbee driver"
    }

    async fn set_value(
        &self,
        device: &DeviceInstance,
        feature: &FeatureBlueprint,
        value: &Value,
    ) -> Result<(), DriverError> {
        let missing = || DriverError::MissingEncoding {
            model: device.model_code.clone(),
            feature: feature.code.clone(),
        };
        let encoding = feature.encoding.as_ref().ok_or_else(missing)?;
        let payload = render_payload(encoding, feature.feature_type, value).ok_or_else(missing)?;
        let topic = render_topic(&encoding.topic_pattern, device, &feature.code);

        debug!(
            device_id = %device.id,
            feature = %feature.code,
            topic = %topic,
            "Publishing Zigbee command"
        );
        self.transport
            .publish(&topic, to_bytes(&feature.code, &payload)?)
            .await?;
        Ok(())
    }
}
