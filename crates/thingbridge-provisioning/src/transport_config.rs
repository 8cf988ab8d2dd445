//! Self-configuration handed to a freshly provisioned device.

use serde::{Deserialize, Serialize};
use thingbridge_core::config::MqttConfig;
use thingbridge_core::Result;
use thingbridge_storage::HardwareIdentity;

use crate::credentials::seal_credentials;

/// Broker a device should connect to, plus the server credentials that
/// get sealed for the chip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerSettings {
    /// Device-facing endpoint from the server's broker settings.
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            host: config.device_host().to_string(),
            port: config.device_port(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Apply the `MQTT_HOST`/`MQTT_USER`/`MQTT_PASS` rows an administrator
    /// stored; rows that are absent keep the configured value.
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if username.is_some() {
            self.username = username;
        }
        if password.is_some() {
            self.password = password;
        }
        self
    }
}

/// Everything the device needs to reach the broker on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    /// Wildcard over every feature's `set` topic
    pub command_topic: String,
    pub status_topic: String,
    pub state_topic: String,
    pub telemetry_topic: String,
    /// hex(nonce ‖ AES-256-GCM(`user|pass`)); only with server credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_credentials: Option<String>,
}

impl TransportConfig {
    pub fn for_hardware(broker: &BrokerSettings, hardware: &HardwareIdentity) -> Result<Self> {
        let token = &hardware.device_token;
        let prefix = format!("{}/{}/{}", hardware.partner_code, hardware.model_code, token);

        let sealed_credentials = match &broker.username {
            Some(user) => Some(seal_credentials(
                &hardware.physical_id,
                token,
                user,
                broker.password.as_deref().unwrap_or_default(),
            )?),
            None => None,
        };

        Ok(Self {
            broker: broker.host.clone(),
            port: broker.port,
            username: token.clone(),
            password: token.clone(),
            client_id: format!("device_{}", hardware.physical_id),
            command_topic: format!("{prefix}/+/set"),
            status_topic: format!("{prefix}/status"),
            state_topic: format!("{prefix}/state"),
            telemetry_topic: format!("{prefix}/telemetry"),
            sealed_credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::open_credentials;
    use chrono::Utc;

    fn hardware() -> HardwareIdentity {
        let now = Utc::now();
        HardwareIdentity {
            physical_id: "AA:BB:CC:DD:EE:FF".into(),
            partner_code: "ACME".into(),
            model_code: "RELAY".into(),
            device_token: "tok".into(),
            device_id: None,
            banned: false,
            registered_at: now,
            activated_at: now,
        }
    }

    #[test]
    fn test_topics_follow_inbound_shape() {
        let broker = BrokerSettings {
            host: "broker.local".into(),
            port: 1883,
            ..Default::default()
        };
        let config = TransportConfig::for_hardware(&broker, &hardware()).unwrap();

        assert_eq!(config.username, "tok");
        assert_eq!(config.password, "tok");
        assert_eq!(config.client_id, "device_AA:BB:CC:DD:EE:FF");
        assert_eq!(config.command_topic, "ACME/RELAY/tok/+/set");
        assert_eq!(config.status_topic, "ACME/RELAY/tok/status");
        assert_eq!(config.state_topic, "ACME/RELAY/tok/state");
        assert_eq!(config.telemetry_topic, "ACME/RELAY/tok/telemetry");
        assert!(config.sealed_credentials.is_none());
    }

    #[test]
    fn test_server_credentials_are_sealed() {
        let broker = BrokerSettings {
            host: "broker.local".into(),
            port: 8883,
            username: Some("svc".into()),
            password: Some("pw".into()),
        };
        let hw = hardware();
        let config = TransportConfig::for_hardware(&broker, &hw).unwrap();
        let sealed = config.sealed_credentials.unwrap();

        let (user, pass) = open_credentials(&hw.physical_id, &hw.device_token, &sealed).unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("svc", "pw"));
    }

    #[test]
    fn test_overrides() {
        let mqtt = MqttConfig {
            public_host: Some("public.example".into()),
            public_port: Some(8883),
            ..Default::default()
        };
        let broker = BrokerSettings::from_config(&mqtt).with_overrides(
            Some("admin.example".into()),
            Some("svc".into()),
            None,
        );
        assert_eq!(broker.host, "admin.example");
        assert_eq!(broker.port, 8883);
        assert_eq!(broker.username.as_deref(), Some("svc"));
        assert!(broker.password.is_none());
    }
}
