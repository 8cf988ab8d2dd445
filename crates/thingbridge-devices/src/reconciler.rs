//! Shadow reconciler: inbound device traffic → shadow state.
//!
//! Devices publish on `{tenant}/{model}/{token}/{kind}` where `kind` is
//! `status`, `state` or `telemetry`. Inbound traffic is untrusted, so every
//! failure ends as a logged [`MessageOutcome::Discarded`] and never as an
//! error out of the listener.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thingbridge_core::state::{keys, shadow_value};
use thingbridge_core::{
    DeviceEvent, DeviceStatus, EventBus, Job, JobKind, JobOptions, JobPriority, Result, StateStore,
    WorkQueue,
};
use thingbridge_storage::{DeviceInstance, LicenseStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use crate::registry::DriverRegistry;
use crate::transport::MessageTransport;

/// Topic filters the reconciler listens on.
pub const INBOUND_SUBSCRIPTIONS: [&str; 3] = ["+/+/+/status", "+/+/+/state", "+/+/+/telemetry"];

const EVENT_SOURCE: &str = "reconciler";

/// Device token of an inbound topic: the third of at least four segments.
///
/// ```
/// use thingbridge_devices::extract_token;
/// assert_eq!(extract_token("A/B/TOK/status"), Some("TOK"));
/// assert_eq!(extract_token("short"), None);
/// ```
pub fn extract_token(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let (_tenant, _model, token, _kind) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if token.is_empty() {
        return None;
    }
    Some(token)
}

/// Payload of an `UpdateLastSeen` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastSeenUpdate {
    pub token: String,
    pub status: DeviceStatus,
    pub seen_at: DateTime<Utc>,
}

/// Why an inbound message was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Fewer than four topic segments, or an empty token.
    MalformedTopic,
    UnknownKind(String),
    /// Token does not belong to a live device (never issued, or rotated).
    UnknownToken,
    MalformedPayload(String),
    Store(String),
}

/// What the reconciler did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Status {
        token: String,
        status: DeviceStatus,
        changed: bool,
    },
    State {
        token: String,
        fields: usize,
    },
    /// Accepted but not ingested.
    Telemetry { token: String },
    Discarded(DiscardReason),
}

impl MessageOutcome {
    pub fn is_discarded(&self) -> bool {
        matches!(self, MessageOutcome::Discarded(_))
    }
}

/// Applies device status and state reports to the shadow store.
pub struct ShadowReconciler {
    store: Arc<LicenseStore>,
    state: Arc<dyn StateStore>,
    drivers: Arc<DriverRegistry>,
    events: EventBus,
    queue: Arc<dyn WorkQueue>,
    status_ttl: Option<Duration>,
}

impl ShadowReconciler {
    pub fn new(
        store: Arc<LicenseStore>,
        state: Arc<dyn StateStore>,
        drivers: Arc<DriverRegistry>,
        events: EventBus,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            store,
            state,
            drivers,
            events,
            queue,
            status_ttl: None,
        }
    }

    /// Expire `status:<token>` keys after `ttl`.
    pub fn with_status_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Subscribe to the inbound topics and handle messages in arrival order
    /// until the transport closes.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn MessageTransport>) -> Result<()> {
        let mut rx = transport.incoming();
        for pattern in INBOUND_SUBSCRIPTIONS {
            transport.subscribe(pattern).await?;
        }
        info!(category = "reconciler", "Shadow reconciler listening");

        loop {
            match rx.recv().await {
                Ok(message) => {
                    self.handle_message(&message.topic, &message.payload).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(category = "reconciler", skipped, "Inbound channel lagged, messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!(category = "reconciler", "Shadow reconciler stopped");
        Ok(())
    }

    /// Handle one inbound message. Never fails.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        let Some(token) = extract_token(topic) else {
            warn!(category = "reconciler", topic, "Invalid topic format");
            return MessageOutcome::Discarded(DiscardReason::MalformedTopic);
        };
        let kind = topic.split('/').nth(3).unwrap_or_default();

        let result = match kind {
            "status" => self.handle_status(token, payload).await,
            "state" => self.handle_state(token, payload).await,
            "telemetry" => {
                trace!(token, bytes = payload.len(), "Telemetry received");
                Ok(MessageOutcome::Telemetry {
                    token: token.to_string(),
                })
            }
            other => Err(DiscardReason::UnknownKind(other.to_string())),
        };

        match result {
            Ok(outcome) => outcome,
            Err(reason) => {
                match &reason {
                    DiscardReason::UnknownToken => {
                        debug!(category = "reconciler", token, "Message for unknown token dropped")
                    }
                    other => {
                        warn!(category = "reconciler", topic, reason = ?other, "Inbound message dropped")
                    }
                }
                MessageOutcome::Discarded(reason)
            }
        }
    }

    async fn handle_status(
        &self,
        token: &str,
        payload: &[u8],
    ) -> std::result::Result<MessageOutcome, DiscardReason> {
        let body = std::str::from_utf8(payload)
            .map_err(|e| DiscardReason::MalformedPayload(e.to_string()))?;
        let status: DeviceStatus = body
            .parse()
            .map_err(|e: thingbridge_core::Error| DiscardReason::MalformedPayload(e.to_string()))?;

        self.live_device(token).await?;

        let key = keys::status(token);
        let previous = self.state.get(&key).await.map_err(store_err)?;
        self.state
            .set(&key, status.as_str(), self.status_ttl)
            .await
            .map_err(store_err)?;

        let update = LastSeenUpdate {
            token: token.to_string(),
            status,
            seen_at: Utc::now(),
        };
        let options = JobOptions::default().with_priority(JobPriority::Low);
        let enqueued = match Job::from_payload(JobKind::UpdateLastSeen, &update, options) {
            Ok(job) => self.queue.enqueue(job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = enqueued {
            warn!(category = "reconciler", token, error = %e, "Failed to enqueue last-seen update");
        }

        let changed = previous.as_deref() != Some(status.as_str());
        if changed {
            self.events.publish(
                DeviceEvent::StatusChanged {
                    token: token.to_string(),
                    status,
                    timestamp: update.seen_at,
                },
                EVENT_SOURCE,
            );
        }

        debug!(category = "reconciler", token, status = %status, "Device status updated");
        Ok(MessageOutcome::Status {
            token: token.to_string(),
            status,
            changed,
        })
    }

    async fn handle_state(
        &self,
        token: &str,
        payload: &[u8],
    ) -> std::result::Result<MessageOutcome, DiscardReason> {
        let data = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(DiscardReason::MalformedPayload(
                    "state body is not a JSON object".to_string(),
                ))
            }
            Err(e) => return Err(DiscardReason::MalformedPayload(e.to_string())),
        };

        let device = self.live_device(token).await?;
        let driver = self.drivers.resolve(device.protocol);

        let fields: Vec<(String, String)> = data
            .iter()
            .map(|(code, raw)| {
                let value = match device.feature(code) {
                    Some(feature) => driver.normalize(feature, raw),
                    None => shadow_value(raw),
                };
                (keys::reported(code), value)
            })
            .collect();

        if !fields.is_empty() {
            self.state
                .hset(&keys::shadow(token), &fields)
                .await
                .map_err(store_err)?;
        }

        self.events.publish(
            DeviceEvent::DeviceUpdate {
                token: token.to_string(),
                data,
                timestamp: Utc::now(),
            },
            EVENT_SOURCE,
        );

        Ok(MessageOutcome::State {
            token: token.to_string(),
            fields: fields.len(),
        })
    }

    async fn live_device(&self, token: &str) -> std::result::Result<DeviceInstance, DiscardReason> {
        let owned = token.to_string();
        self.store
            .blocking(move |store| store.device_by_token(&owned))
            .await
            .map_err(store_err)?
            .ok_or(DiscardReason::UnknownToken)
    }
}

fn store_err(e: thingbridge_core::Error) -> DiscardReason {
    DiscardReason::Store(e.to_string())
}
