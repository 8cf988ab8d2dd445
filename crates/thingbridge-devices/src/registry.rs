//! Protocol → driver lookup.

use std::sync::Arc;

use serde_json::Value;
use thingbridge_storage::{DeviceFeature, DeviceInstance, FeatureBlueprint, Protocol};
use tracing::info;

use crate::driver::DeviceDriver;
use crate::drivers::{MqttDriver, ZigbeeDriver};
use crate::error::DriverError;
use crate::transport::MessageTransport;

/// Driver types.
#[derive(Clone)]
pub enum AnyDriver {
    Mqtt(MqttDriver),
    Zigbee(ZigbeeDriver),
}

impl AnyDriver {
    fn inner(&self) -> &dyn DeviceDriver {
        match self {
            AnyDriver::Mqtt(d) => d as &dyn DeviceDriver,
            AnyDriver::Zigbee(d) => d as &dyn DeviceDriver,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.inner().protocol()
    }

    pub fn name(&self) -> &str {
        self.inner().name()
    }

    pub async fn set_value(
        &self,
        device: &DeviceInstance,
        feature: &FeatureBlueprint,
        value: &Value,
    ) -> Result<(), DriverError> {
        match self {
            AnyDriver::Mqtt(d) => d.set_value(device, feature, value).await,
            AnyDriver::Zigbee(d) => d.set_value(device, feature, value).await,
        }
    }

    pub fn normalize(&self, feature: &DeviceFeature, raw: &Value) -> String {
        self.inner().normalize(feature, raw)
    }
}

/// One driver per [`Protocol`].
///
/// Built once at start-up and read-only afterwards. Every protocol always
/// has a driver, so resolving cannot fail.
#[derive(Clone)]
pub struct DriverRegistry {
    mqtt: AnyDriver,
    zigbee: AnyDriver,
}

impl DriverRegistry {
    /// Registry with the built-in drivers, all publishing over `transport`.
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        let registry = Self {
            mqtt: AnyDriver::Mqtt(MqttDriver::new(transport.clone())),
            zigbee: AnyDriver::Zigbee(ZigbeeDriver::new(transport)),
        };
        info!(
            category = "devices",
            drivers = Protocol::ALL.len(),
            "Driver registry initialized"
        );
        registry
    }

    /// Replace the driver for the protocol it serves.
    pub fn register(&mut self, driver: AnyDriver) {
        match driver {
            AnyDriver::Mqtt(_) => self.mqtt = driver,
            AnyDriver::Zigbee(_) => self.zigbee = driver,
        }
    }

    pub fn resolve(&self, protocol: Protocol) -> &AnyDriver {
        match protocol {
            Protocol::Mqtt => &self.mqtt,
            Protocol::Zigbee => &self.zigbee,
        }
    }
}
