//! Built-in drivers.

mod mqtt;
mod zigbee;

pub use mqtt::MqttDriver;
pub use zigbee::ZigbeeDriver;

use serde_json::Value;

use crate::error::DriverError;

fn to_bytes(feature: &str, payload: &Value) -> Result<Vec<u8>, DriverError> {
    serde_json::to_vec(payload).map_err(|e| DriverError::Encoding {
        feature: feature.to_string(),
        reason: e.to_string(),
    })
}
