//! Shadow reconciler tests.
//!
//! Tests status and state ingestion, discard rules for malformed or stale
//! traffic, and the subscription loop over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use thingbridge_core::state::keys;
use thingbridge_core::{
    DeviceEvent, DeviceStatus, EventBus, JobKind, MemoryWorkQueue, StateStore, WorkQueue,
};
use thingbridge_devices::{
    DiscardReason, DriverRegistry, LastSeenUpdate, MemoryTransport, MessageOutcome,
    MessageTransport, Protocol, ShadowReconciler,
};
use thingbridge_storage::{
    DeviceInstance, DeviceModel, FeatureBlueprint, FeatureType, HardwareIdentity, LicenseStore,
    MemoryStateStore, Placement,
};

const TOKEN: &str = "livetoken";

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<LicenseStore>,
    state: Arc<MemoryStateStore>,
    queue: Arc<MemoryWorkQueue>,
    events: EventBus,
    transport: Arc<MemoryTransport>,
    reconciler: Arc<ShadowReconciler>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = LicenseStore::open(dir.path().join("reconciler.redb")).unwrap();

    let model = DeviceModel::new("RELAY", "Relay", Protocol::Mqtt)
        .with_feature(FeatureBlueprint::new("relay_1", "Relay 1", FeatureType::Binary))
        .with_feature(FeatureBlueprint::new("temp", "Temperature", FeatureType::Number).read_only());
    let now = Utc::now();
    let hardware = HardwareIdentity {
        physical_id: "AA:BB".into(),
        partner_code: "ACME".into(),
        model_code: "RELAY".into(),
        device_token: TOKEN.into(),
        device_id: None,
        banned: false,
        registered_at: now,
        activated_at: now,
    };
    let device = DeviceInstance::from_blueprint(
        &hardware,
        &model,
        "alice",
        "Relay",
        Protocol::Mqtt,
        Placement::default(),
    );
    let txn = store.begin().unwrap();
    txn.put_model(&model).unwrap();
    txn.put_device(&device).unwrap();
    txn.commit().unwrap();

    let state = Arc::new(MemoryStateStore::new());
    let queue = Arc::new(MemoryWorkQueue::new(100));
    let events = EventBus::new();
    let transport = Arc::new(MemoryTransport::new());
    let shared_transport: Arc<dyn MessageTransport> = transport.clone();
    let reconciler = Arc::new(ShadowReconciler::new(
        store.clone(),
        state.clone(),
        Arc::new(DriverRegistry::new(shared_transport)),
        events.clone(),
        queue.clone(),
    ));

    Harness {
        _dir: dir,
        store,
        state,
        queue,
        events,
        transport,
        reconciler,
    }
}

#[tokio::test]
async fn test_status_sets_key_and_enqueues_last_seen() {
    let h = harness();
    let mut room = h.events.subscribe_room(keys::room(TOKEN));

    let outcome = h
        .reconciler
        .handle_message(&format!("ACME/RELAY/{TOKEN}/status"), b"online")
        .await;
    assert_eq!(
        outcome,
        MessageOutcome::Status {
            token: TOKEN.into(),
            status: DeviceStatus::Online,
            changed: true,
        }
    );

    assert_eq!(
        h.state.get(&keys::status(TOKEN)).await.unwrap().as_deref(),
        Some("online")
    );

    let job = h.queue.try_dequeue().await.unwrap();
    assert_eq!(job.kind, JobKind::UpdateLastSeen);
    let update: LastSeenUpdate = job.payload_as().unwrap();
    assert_eq!(update.token, TOKEN);
    assert_eq!(update.status, DeviceStatus::Online);

    let (event, _) = room.try_recv().unwrap();
    assert_eq!(event.name(), "STATUS_CHANGED");
}

#[tokio::test]
async fn test_repeated_status_is_not_a_change() {
    let h = harness();
    let topic = format!("ACME/RELAY/{TOKEN}/status");
    h.reconciler.handle_message(&topic, b"online").await;
    let outcome = h.reconciler.handle_message(&topic, b" ONLINE ").await;

    assert!(matches!(outcome, MessageOutcome::Status { changed: false, .. }));
    assert_eq!(h.queue.len().await, 2);
}

#[tokio::test]
async fn test_malformed_topic_touches_nothing() {
    let h = harness();
    let outcome = h.reconciler.handle_message("short", b"online").await;

    assert_eq!(outcome, MessageOutcome::Discarded(DiscardReason::MalformedTopic));
    assert!(h.state.is_empty());
    assert_eq!(h.queue.len().await, 0);
}

#[tokio::test]
async fn test_bad_status_body_is_discarded() {
    let h = harness();
    let outcome = h
        .reconciler
        .handle_message(&format!("ACME/RELAY/{TOKEN}/status"), b"rebooting")
        .await;

    assert!(matches!(
        outcome,
        MessageOutcome::Discarded(DiscardReason::MalformedPayload(_))
    ));
    assert!(h.state.get(&keys::status(TOKEN)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_state_merges_normalized_reported_fields() {
    let h = harness();
    h.state
        .hset(&keys::shadow(TOKEN), &[(keys::desired("relay_1"), "1".to_string())])
        .await
        .unwrap();
    let mut room = h.events.subscribe_room(keys::room(TOKEN));

    let outcome = h
        .reconciler
        .handle_message(
            &format!("ACME/RELAY/{TOKEN}/state"),
            br#"{"relay_1": "ON", "temp": 21.5}"#,
        )
        .await;
    assert_eq!(
        outcome,
        MessageOutcome::State {
            token: TOKEN.into(),
            fields: 2,
        }
    );

    let shadow = h.state.hgetall(&keys::shadow(TOKEN)).await.unwrap();
    assert_eq!(shadow["reported:relay_1"], "1");
    assert_eq!(shadow["reported:temp"], "21.5");
    // dispatcher's namespace is left alone
    assert_eq!(shadow["desired:relay_1"], "1");

    match room.try_recv().unwrap().0 {
        DeviceEvent::DeviceUpdate { token, data, .. } => {
            assert_eq!(token, TOKEN);
            assert_eq!(data["relay_1"], "ON");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_state_never_mutates_shadow() {
    let h = harness();
    let topic = format!("ACME/RELAY/{TOKEN}/state");

    for body in [&b"{not json"[..], &b"[1,2,3]"[..], &b"\"ON\""[..], &b""[..]] {
        let outcome = h.reconciler.handle_message(&topic, body).await;
        assert!(outcome.is_discarded());
    }
    assert!(h.state.hgetall(&keys::shadow(TOKEN)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_token_is_discarded() {
    let h = harness();
    let status = h
        .reconciler
        .handle_message("ACME/RELAY/rotated/status", b"online")
        .await;
    let state = h
        .reconciler
        .handle_message("ACME/RELAY/rotated/state", br#"{"relay_1":"ON"}"#)
        .await;

    assert_eq!(status, MessageOutcome::Discarded(DiscardReason::UnknownToken));
    assert_eq!(state, MessageOutcome::Discarded(DiscardReason::UnknownToken));
    assert!(h.state.is_empty());
    assert_eq!(h.queue.len().await, 0);
}

#[tokio::test]
async fn test_telemetry_is_accepted_without_side_effects() {
    let h = harness();
    let outcome = h
        .reconciler
        .handle_message(&format!("ACME/RELAY/{TOKEN}/telemetry"), br#"{"t": 1}"#)
        .await;
    assert_eq!(outcome, MessageOutcome::Telemetry { token: TOKEN.into() });
    assert!(h.state.is_empty());
}

#[tokio::test]
async fn test_run_loop_applies_in_arrival_order() {
    let h = harness();
    let transport: Arc<dyn MessageTransport> = h.transport.clone();
    let task = tokio::spawn(h.reconciler.clone().run(transport));

    // wait for the subscriptions
    for _ in 0..50 {
        if h.transport.subscriptions().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let topic = format!("ACME/RELAY/{TOKEN}/state");
    assert!(h.transport.inject(&topic, r#"{"relay_1":"ON"}"#));
    assert!(h.transport.inject(&topic, r#"{"relay_1":"OFF"}"#));

    let mut last = None;
    for _ in 0..50 {
        last = h
            .state
            .hgetall(&keys::shadow(TOKEN))
            .await
            .unwrap()
            .get("reported:relay_1")
            .cloned();
        if last.as_deref() == Some("0") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last.as_deref(), Some("0"));

    task.abort();
    assert!(h.store.device_by_token(TOKEN).unwrap().is_some());
}
