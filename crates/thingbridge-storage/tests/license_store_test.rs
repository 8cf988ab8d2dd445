//! License store tests.
//!
//! Tests persistence across reopen and the administrative surface as seen
//! from outside the crate.

use chrono::Utc;
use serde_json::json;

use thingbridge_storage::{
    DeviceInstance, DeviceModel, Error, FeatureBlueprint, FeatureEncoding, FeatureType,
    HardwareIdentity, LicenseStore, Placement, Protocol,
};

fn relay_model() -> DeviceModel {
    DeviceModel::new("RELAY_2CH", "Two-channel relay", Protocol::Mqtt)
        .with_feature(
            FeatureBlueprint::new("relay_1", "Relay 1", FeatureType::Binary).with_encoding(
                FeatureEncoding {
                    topic_pattern: "{{partner_code}}/{{device_token}}/relay_1/set".into(),
                    payload_on: Some(json!({"state": "ON"})),
                    payload_off: Some(json!({"state": "OFF"})),
                    payload_template: None,
                },
            ),
        )
        .with_feature(FeatureBlueprint::new("power", "Power", FeatureType::Number).read_only())
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("license.redb");

    {
        let store = LicenseStore::open(&path).unwrap();
        store.create_partner("ACME", "Acme").unwrap();
        store.create_model(relay_model()).unwrap();
        store.upsert_quota("ACME", "RELAY_2CH", 3, true).unwrap();
    }

    let store = LicenseStore::open(&path).unwrap();
    assert_eq!(store.partner("ACME").unwrap().unwrap().name, "Acme");
    let model = store.model("RELAY_2CH").unwrap().unwrap();
    assert_eq!(model.features.len(), 2);
    assert!(model.feature("relay_1").unwrap().encoding.is_some());
    assert_eq!(store.quota("ACME", "RELAY_2CH").unwrap().unwrap().max_quantity, 3);
}

#[test]
fn test_model_conflict() {
    let store = LicenseStore::open(":memory:").unwrap();
    store.create_model(relay_model()).unwrap();
    assert!(matches!(store.create_model(relay_model()), Err(Error::Conflict(_))));
    assert_eq!(store.list_models().unwrap().len(), 1);
}

#[test]
fn test_devices_for_owner() {
    let dir = tempfile::tempdir().unwrap();
    let store = LicenseStore::open(dir.path().join("owners.redb")).unwrap();
    let model = relay_model();
    let now = Utc::now();

    let txn = store.begin().unwrap();
    for (i, owner) in ["alice", "alice", "bob"].iter().enumerate() {
        let hardware = HardwareIdentity {
            physical_id: format!("AA:00:{i}"),
            partner_code: "ACME".into(),
            model_code: model.code.clone(),
            device_token: format!("tok-{i}"),
            device_id: None,
            banned: false,
            registered_at: now,
            activated_at: now,
        };
        let device = DeviceInstance::from_blueprint(
            &hardware,
            &model,
            *owner,
            "Relay",
            Protocol::Mqtt,
            Placement::default(),
        );
        txn.put_device(&device).unwrap();
    }
    txn.commit().unwrap();

    assert_eq!(store.devices_for_owner("alice").unwrap().len(), 2);
    assert_eq!(store.devices_for_owner("bob").unwrap().len(), 1);
    assert!(store.devices_for_owner("carol").unwrap().is_empty());
    assert_eq!(store.device_count().unwrap(), 3);
}

#[test]
fn test_quota_listing() {
    let store = LicenseStore::open(":memory:").unwrap();
    store.create_partner("ACME", "Acme").unwrap();
    store.create_partner("BETA", "Beta").unwrap();
    store.create_model(relay_model()).unwrap();
    store.upsert_quota("ACME", "RELAY_2CH", 5, true).unwrap();
    store.upsert_quota("BETA", "RELAY_2CH", 1, false).unwrap();

    let quotas = store.list_quotas().unwrap();
    assert_eq!(quotas.len(), 2);
    let beta = quotas.iter().find(|q| q.partner_code == "BETA").unwrap();
    assert!(!beta.active);
    assert!(!beta.has_capacity());
    assert_eq!(store.list_partners().unwrap().len(), 2);
}
