//! Job processor tests.
//!
//! Tests delivery through the driver registry, the retry and dead-letter
//! path with its device events, and last-seen bookkeeping.

mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{fixture, Fixture, OWNER, TOKEN};
use thingbridge_commands::{ControlCommand, JobOutcome, JobProcessor};
use thingbridge_core::config::WorkerConfig;
use thingbridge_core::{
    DeviceEvent, DeviceStatus, Job, JobKind, JobOptions, JobPriority, RetryPolicy, WorkQueue,
};
use thingbridge_devices::LastSeenUpdate;

const RELAY_TOPIC: &str = "ACME/RELAY/tok-relay/relay_1/set";

fn processor(f: &Fixture) -> JobProcessor {
    JobProcessor::new(
        f.queue.clone(),
        f.store.clone(),
        f.drivers.clone(),
        f.events.clone(),
        WorkerConfig {
            poll_interval_ms: 10,
            max_concurrent: 4,
        },
    )
}

async fn enqueue_control(f: &Fixture, feature: &str, retry: RetryPolicy) -> String {
    let command = ControlCommand {
        device_id: f.device.id.clone(),
        feature_code: feature.to_string(),
        value: json!(1),
    };
    let options = JobOptions::default()
        .with_priority(JobPriority::High)
        .with_retry(retry);
    f.queue
        .enqueue(Job::from_payload(JobKind::ControlDevice, &command, options).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_processor_creation() {
    let f = fixture();
    let processor = processor(&f);
    assert!(!processor.is_running().await);
    assert!(processor.process_next().await.is_none());
}

#[tokio::test]
async fn test_delivery_publishes_and_announces() {
    let f = fixture();
    let processor = processor(&f);
    let mut room = f.events.subscribe_room(format!("device_{TOKEN}"));
    let job_id = enqueue_control(&f, "relay_1", RetryPolicy::new(3, 0, 0)).await;

    let outcome = processor.process_next().await.unwrap();
    assert_eq!(outcome, JobOutcome::Delivered { job_id });

    assert_eq!(f.transport.published_to(RELAY_TOPIC), vec![b"\"ON\"".to_vec()]);

    let (event, _) = room.try_recv().unwrap();
    match event {
        DeviceEvent::CommandSent {
            device_id,
            feature_code,
            value,
            status,
            ..
        } => {
            assert_eq!(device_id, f.device.id);
            assert_eq!(feature_code, "relay_1");
            assert_eq!(value, json!(1));
            assert_eq!(status, "sent");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stats = f.queue.stats().await;
    assert_eq!(stats.completed_count, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_transient_failure_retries_then_delivers() {
    let f = fixture();
    let processor = processor(&f);
    let mut room = f.events.subscribe_room(format!("device_{TOKEN}"));
    let job_id = enqueue_control(&f, "relay_1", RetryPolicy::new(3, 0, 0)).await;
    f.transport.fail_next(1);

    let first = processor.process_next().await.unwrap();
    assert!(matches!(first, JobOutcome::Retrying { attempt: 1, .. }));
    let (event, _) = room.try_recv().unwrap();
    assert!(matches!(event, DeviceEvent::CommandError { attempt: 1, .. }));

    let second = processor.process_next().await.unwrap();
    assert_eq!(second, JobOutcome::Delivered { job_id });
    let (event, _) = room.try_recv().unwrap();
    assert!(matches!(event, DeviceEvent::CommandSent { .. }));
    assert_eq!(f.transport.published_to(RELAY_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_exhausted_attempts_dead_letter() {
    let f = fixture();
    let processor = processor(&f);
    let mut room = f.events.subscribe_room(format!("device_{TOKEN}"));
    let job_id = enqueue_control(&f, "relay_1", RetryPolicy::new(2, 0, 0)).await;
    f.transport.set_offline(true);

    let first = processor.process_next().await.unwrap();
    assert!(matches!(first, JobOutcome::Retrying { attempt: 1, .. }));
    let second = processor.process_next().await.unwrap();
    assert_eq!(
        second,
        JobOutcome::Failed {
            job_id: job_id.clone(),
            attempts: 2
        }
    );
    assert!(processor.process_next().await.is_none());

    let names: Vec<&str> = std::iter::from_fn(|| room.try_recv())
        .map(|(event, _)| event.name())
        .collect();
    assert_eq!(names, vec!["COMMAND_ERROR", "COMMAND_ERROR", "COMMAND_FAILED"]);

    let dead = f.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert!(dead[0].last_error.is_some());
}

#[tokio::test]
async fn test_missing_feature_is_dropped() {
    let f = fixture();
    let processor = processor(&f);
    enqueue_control(&f, "dimmer", RetryPolicy::new(3, 0, 0)).await;

    let outcome = processor.process_next().await.unwrap();
    assert!(matches!(outcome, JobOutcome::Dropped { .. }));
    assert!(f.transport.published().is_empty());
    assert!(f.queue.dead_letters().await.is_empty());
    assert_eq!(f.queue.stats().await.completed_count, 1);
}

#[tokio::test]
async fn test_undecodable_payload_rejected() {
    let f = fixture();
    let processor = processor(&f);
    f.queue
        .enqueue(Job::new(
            JobKind::ControlDevice,
            json!({"unexpected": true}),
            JobOptions::default(),
        ))
        .await
        .unwrap();

    let outcome = processor.process_next().await.unwrap();
    assert!(matches!(outcome, JobOutcome::Rejected { .. }));
    assert_eq!(f.queue.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn test_last_seen_recorded() {
    let f = fixture();
    let processor = processor(&f);
    let update = LastSeenUpdate {
        token: TOKEN.to_string(),
        status: DeviceStatus::Online,
        seen_at: Utc::now(),
    };
    f.queue
        .enqueue(Job::from_payload(JobKind::UpdateLastSeen, &update, JobOptions::default()).unwrap())
        .await
        .unwrap();

    let outcome = processor.process_next().await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::LastSeenRecorded {
            token: TOKEN.to_string()
        }
    );

    let device = f.store.device(&f.device.id).unwrap().unwrap();
    assert!(device.online);
    assert!(device.last_seen.is_some());
    assert_eq!(device.owner_id, OWNER);
}

#[tokio::test]
async fn test_last_seen_for_rotated_token_dropped() {
    let f = fixture();
    let processor = processor(&f);
    let update = LastSeenUpdate {
        token: "stale-token".to_string(),
        status: DeviceStatus::Offline,
        seen_at: Utc::now(),
    };
    f.queue
        .enqueue(Job::from_payload(JobKind::UpdateLastSeen, &update, JobOptions::default()).unwrap())
        .await
        .unwrap();

    let outcome = processor.process_next().await.unwrap();
    assert!(matches!(outcome, JobOutcome::Dropped { .. }));
}

#[tokio::test]
async fn test_processor_start_stop() {
    let f = fixture();
    let processor = processor(&f);
    enqueue_control(&f, "relay_1", RetryPolicy::new(3, 0, 0)).await;

    processor.start().await;
    assert!(processor.is_running().await);

    let mut delivered = false;
    for _ in 0..100 {
        if !f.transport.published_to(RELAY_TOPIC).is_empty() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered);

    processor.stop().await;
    assert!(!processor.is_running().await);
}
