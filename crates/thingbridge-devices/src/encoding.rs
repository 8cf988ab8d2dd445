//! Rendering of blueprint encodings into topics and payloads.

use serde_json::Value;
use thingbridge_core::state::shadow_value;
use thingbridge_storage::{DeviceInstance, FeatureEncoding, FeatureType};

pub const PARTNER_PLACEHOLDER: &str = "{{partner_code}}";
pub const MODEL_PLACEHOLDER: &str = "{{model_code}}";
pub const TOKEN_PLACEHOLDER: &str = "{{device_token}}";
pub const FEATURE_PLACEHOLDER: &str = "{{feature_code}}";
pub const VALUE_PLACEHOLDER: &str = "{{value}}";

/// Fill the topic placeholders for one device and feature.
pub fn render_topic(pattern: &str, device: &DeviceInstance, feature_code: &str) -> String {
    pattern
        .replace(PARTNER_PLACEHOLDER, &device.partner_code)
        .replace(MODEL_PLACEHOLDER, &device.model_code)
        .replace(TOKEN_PLACEHOLDER, &device.token)
        .replace(FEATURE_PLACEHOLDER, feature_code)
}

/// `{tenant}/{model}/{token}/{feature}/set`
pub fn default_set_topic(device: &DeviceInstance, feature_code: &str) -> String {
    format!(
        "{}/{}/{}/{}/set",
        device.partner_code, device.model_code, device.token, feature_code
    )
}

/// Interpret a value as an on/off switch position.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "on" | "true"
        ),
        _ => false,
    }
}

/// Substitute `{{value}}` into a payload template.
///
/// A string that is exactly the placeholder takes the value with its JSON
/// type; a string that merely contains it gets the textual form.
pub fn render_template(template: &Value, value: &Value) -> Value {
    match template {
        Value::String(s) if s == VALUE_PLACEHOLDER => value.clone(),
        Value::String(s) if s.contains(VALUE_PLACEHOLDER) => {
            Value::String(s.replace(VALUE_PLACEHOLDER, &shadow_value(value)))
        }
        Value::Array(items) => Value::Array(items.iter().map(|i| render_template(i, value)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_template(v, value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Payload for a feature with a declared encoding. `None` when the
/// encoding lacks the template this feature type needs.
pub fn render_payload(
    encoding: &FeatureEncoding,
    feature_type: FeatureType,
    value: &Value,
) -> Option<Value> {
    match feature_type {
        FeatureType::Binary => {
            if is_truthy(value) {
                encoding.payload_on.clone()
            } else {
                encoding.payload_off.clone()
            }
        }
        _ => encoding
            .payload_template
            .as_ref()
            .map(|template| render_template(template, value)),
    }
}

/// Canonical shadow form of a feature value, used for both the desired and
/// the reported side.
pub fn normalize_value(feature_type: FeatureType, raw: &Value) -> String {
    if feature_type == FeatureType::Binary {
        let text = shadow_value(raw);
        match text.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => return "1".to_string(),
            "off" | "false" | "0" => return "0".to_string(),
            _ => {}
        }
    }
    shadow_value(raw)
}
