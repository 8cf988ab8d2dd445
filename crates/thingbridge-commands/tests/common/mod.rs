//! Shared fixtures for command tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use thingbridge_core::state::keys;
use thingbridge_core::{EventBus, MemoryWorkQueue, RetryPolicy, StateStore};
use thingbridge_devices::{
    DriverRegistry, MemoryTransport, MessageTransport, Protocol, ShadowReconciler,
};
use thingbridge_storage::{
    DeviceInstance, DeviceModel, FeatureBlueprint, FeatureEncoding, FeatureType, HardwareIdentity,
    LicenseStore, MemoryStateStore, Placement,
};

use thingbridge_commands::CommandDispatcher;

pub const OWNER: &str = "alice";
pub const TOKEN: &str = "tok-relay";

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub store: Arc<LicenseStore>,
    pub state: Arc<MemoryStateStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub transport: Arc<MemoryTransport>,
    pub drivers: Arc<DriverRegistry>,
    pub events: EventBus,
    pub device: DeviceInstance,
}

pub fn relay_model() -> DeviceModel {
    DeviceModel::new("RELAY", "Relay", Protocol::Mqtt)
        .with_feature(
            FeatureBlueprint::new("relay_1", "Relay 1", FeatureType::Binary).with_encoding(
                FeatureEncoding {
                    topic_pattern: "{{partner_code}}/{{model_code}}/{{device_token}}/relay_1/set"
                        .into(),
                    payload_on: Some(json!("ON")),
                    payload_off: Some(json!("OFF")),
                    payload_template: None,
                },
            ),
        )
        .with_feature(FeatureBlueprint::new("power", "Power", FeatureType::Number).read_only())
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = LicenseStore::open(dir.path().join("commands.redb")).unwrap();
    let model = relay_model();

    let now = Utc::now();
    let hardware = HardwareIdentity {
        physical_id: "AA:BB:CC:00:00:01".into(),
        partner_code: "ACME".into(),
        model_code: model.code.clone(),
        device_token: TOKEN.into(),
        device_id: None,
        banned: false,
        registered_at: now,
        activated_at: now,
    };
    let device =
        DeviceInstance::from_blueprint(&hardware, &model, OWNER, "Relay", Protocol::Mqtt, Placement::default());

    let txn = store.begin().unwrap();
    txn.put_model(&model).unwrap();
    txn.put_device(&device).unwrap();
    txn.commit().unwrap();

    let transport = Arc::new(MemoryTransport::new());
    let shared: Arc<dyn MessageTransport> = transport.clone();

    Fixture {
        _dir: dir,
        store,
        state: Arc::new(MemoryStateStore::new()),
        queue: Arc::new(MemoryWorkQueue::new(100)),
        drivers: Arc::new(DriverRegistry::new(shared)),
        transport,
        events: EventBus::new(),
        device,
    }
}

impl Fixture {
    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(
            self.store.clone(),
            self.state.clone(),
            self.queue.clone(),
            self.drivers.clone(),
        )
        .with_retry(RetryPolicy::new(3, 0, 0))
    }

    pub fn reconciler(&self) -> ShadowReconciler {
        ShadowReconciler::new(
            self.store.clone(),
            self.state.clone(),
            self.drivers.clone(),
            self.events.clone(),
            self.queue.clone(),
        )
    }

    pub async fn set_online(&self) {
        self.state
            .set(&keys::status(TOKEN), "online", None)
            .await
            .unwrap();
    }
}
