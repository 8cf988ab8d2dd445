//! Publish/subscribe transport seam.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::TransportError;

/// Capacity of the inbound message channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A message received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A hierarchical-topic message broker.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Publish a payload to a concrete topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Start receiving messages whose topic matches `pattern` (`+`/`#`
    /// wildcards).
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Stream of messages for every active subscription.
    fn incoming(&self) -> broadcast::Receiver<InboundMessage>;
}

/// MQTT-style topic filter matching.
///
/// `+` matches exactly one level, a trailing `#` matches any remainder
/// including none.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return pattern_parts.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process transport.
///
/// Records everything published and delivers [`MemoryTransport::inject`]ed
/// messages to subscribers whose pattern matches.
pub struct MemoryTransport {
    tx: broadcast::Sender<InboundMessage>,
    published: Mutex<Vec<InboundMessage>>,
    subscriptions: Mutex<Vec<String>>,
    fail_next: AtomicU32,
    offline: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            tx,
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every publish until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Simulate a device publishing. Returns whether any subscription
    /// matched.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let matched = self
            .subscriptions
            .lock()
            .iter()
            .any(|pattern| topic_matches(pattern, topic));
        if matched {
            let _ = self.tx.send(InboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            });
        }
        matched
    }

    fn should_fail(&self) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        if self.should_fail() {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        trace!(topic, bytes = payload.len(), "Memory transport publish");
        self.published.lock().push(InboundMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|p| p == pattern) {
            subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<InboundMessage> {
        self.tx.subscribe()
    }
}
