use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thingbridge_core::state::shadow_value;
use thingbridge_storage::{DeviceInstance, FeatureBlueprint, Protocol};
use tracing::debug;

use super::to_bytes;
use crate::driver::DeviceDriver;
use crate::encoding::{default_set_topic, render_payload, render_topic};
use crate::error::DriverError;
use crate::transport::MessageTransport;

/// Driver for Wi-Fi devices that talk to the broker directly.
///
/// Uses the blueprint encoding when the feature declares one; otherwise
/// publishes the bare value to `{tenant}/{model}/{token}/{feature}/set`.
#[derive(Clone)]
pub struct MqttDriver {
    transport: Arc<dyn MessageTransport>,
}

impl MqttDriver {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DeviceDriver for MqttDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn name(&self) -> &str {
        "Generic MQTT driver"
    }

    async fn set_value(
        &self,
        device: &DeviceInstance,
        feature: &FeatureBlueprint,
        value: &Value,
    ) -> Result<(), DriverError> {
        let rendered = feature.encoding.as_ref().and_then(|encoding| {
            render_payload(encoding, feature.feature_type, value)
                .map(|payload| (render_topic(&encoding.topic_pattern, device, &feature.code), payload))
        });

        let (topic, payload) = match rendered {
            Some((topic, payload)) => (topic, to_bytes(&feature.code, &payload)?),
            None => (
                default_set_topic(device, &feature.code),
                shadow_value(value).into_bytes(),
            ),
        };

        debug!(
            device_id = %device.id,
            feature = %feature.code,
            topic = %topic,
            "Publishing MQTT command"
        );
        self.transport.publish(&topic, payload).await?;
        Ok(())
    }
}
