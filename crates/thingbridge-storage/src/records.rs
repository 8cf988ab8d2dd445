//! Records kept in the relational store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocols a device can be reached over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Wi-Fi devices talking to the broker directly
    #[default]
    Mqtt,
    /// Zigbee devices behind an MQTT gateway
    Zigbee,
}

impl Protocol {
    /// Every known protocol.
    pub const ALL: [Protocol; 2] = [Protocol::Mqtt, Protocol::Zigbee];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Zigbee => "zigbee",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" | "mqtt_wifi" => Ok(Protocol::Mqtt),
            "zigbee" => Ok(Protocol::Zigbee),
            other => Err(crate::Error::InvalidInput(format!("unknown protocol: {other}"))),
        }
    }
}

/// A tenant. Never deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Partner {
    pub code: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Declared value type of a feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    /// On/off switch
    Binary,
    Number,
    #[default]
    String,
    Enum,
    Color,
}

/// Transport-specific encoding of a feature value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FeatureEncoding {
    /// Topic with `{{partner_code}}`, `{{model_code}}`, `{{device_token}}`
    /// and `{{feature_code}}` placeholders.
    pub topic_pattern: String,
    #[serde(default)]
    pub payload_on: Option<serde_json::Value>,
    #[serde(default)]
    pub payload_off: Option<serde_json::Value>,
    /// JSON template with a `{{value}}` placeholder.
    #[serde(default)]
    pub payload_template: Option<serde_json::Value>,
}

/// One entry of a device model's feature blueprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureBlueprint {
    pub code: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub feature_type: FeatureType,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "mqtt")]
    pub encoding: Option<FeatureEncoding>,
}

impl FeatureBlueprint {
    pub fn new(code: impl Into<String>, name: impl Into<String>, feature_type: FeatureType) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            feature_type,
            read_only: false,
            min: None,
            max: None,
            unit: None,
            category: None,
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: FeatureEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// A product line. Devices copy its blueprint when created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceModel {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub features: Vec<FeatureBlueprint>,
    pub created_at: DateTime<Utc>,
}

impl DeviceModel {
    pub fn new(code: impl Into<String>, name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            protocol,
            features: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_feature(mut self, feature: FeatureBlueprint) -> Self {
        self.features.push(feature);
        self
    }

    pub fn feature(&self, code: &str) -> Option<&FeatureBlueprint> {
        self.features.iter().find(|f| f.code == code)
    }
}

/// Licence ceiling for one (partner, model) pair.
///
/// `activated_count <= max_quantity` holds whenever the quota is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LicenseQuota {
    pub partner_code: String,
    pub model_code: String,
    pub max_quantity: u32,
    pub activated_count: u32,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl LicenseQuota {
    pub fn new(partner_code: impl Into<String>, model_code: impl Into<String>, max_quantity: u32) -> Self {
        Self {
            partner_code: partner_code.into(),
            model_code: model_code.into(),
            max_quantity,
            activated_count: 0,
            active: true,
            updated_at: Utc::now(),
        }
    }

    /// Whether one more unit can be activated.
    pub fn has_capacity(&self) -> bool {
        self.active && self.activated_count < self.max_quantity
    }

    pub fn remaining(&self) -> u32 {
        self.max_quantity.saturating_sub(self.activated_count)
    }
}

/// One physical unit, keyed by its immutable identifier. Never deleted,
/// only reassigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareIdentity {
    /// MAC, IMEI or serial number
    pub physical_id: String,
    pub partner_code: String,
    pub model_code: String,
    /// Current credential; rotated on transfer and re-claim
    pub device_token: String,
    /// Device instance currently bound to this unit
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub banned: bool,
    pub registered_at: DateTime<Utc>,
    pub activated_at: DateTime<Utc>,
}

/// Where a device sits in the owner's home.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Placement {
    #[serde(default)]
    pub home_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// A controllable or readable point on a device instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceFeature {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    pub read_only: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub last_value: String,
}

impl From<&FeatureBlueprint> for DeviceFeature {
    fn from(blueprint: &FeatureBlueprint) -> Self {
        Self {
            code: blueprint.code.clone(),
            name: blueprint.name.clone(),
            feature_type: blueprint.feature_type,
            read_only: blueprint.read_only,
            min: blueprint.min,
            max: blueprint.max,
            unit: blueprint.unit.clone(),
            category: blueprint.category.clone(),
            last_value: "0".to_string(),
        }
    }
}

/// The owner-facing device, bound 1:1 to a hardware identity.
///
/// Replaced, never updated in place, when the hardware is transferred or
/// re-claimed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInstance {
    pub id: String,
    pub name: String,
    pub token: String,
    pub physical_id: String,
    pub protocol: Protocol,
    pub partner_code: String,
    pub model_code: String,
    pub owner_id: String,
    #[serde(default)]
    pub placement: Placement,
    pub features: Vec<DeviceFeature>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeviceInstance {
    /// Materialize a new instance from the model's blueprint.
    pub fn from_blueprint(
        hardware: &HardwareIdentity,
        model: &DeviceModel,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        protocol: Protocol,
        placement: Placement,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            token: hardware.device_token.clone(),
            physical_id: hardware.physical_id.clone(),
            protocol,
            partner_code: hardware.partner_code.clone(),
            model_code: model.code.clone(),
            owner_id: owner_id.into(),
            placement,
            features: model.features.iter().map(DeviceFeature::from).collect(),
            online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    pub fn feature(&self, code: &str) -> Option<&DeviceFeature> {
        self.features.iter().find(|f| f.code == code)
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}
