//! Broker connection over rumqttc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thingbridge_core::config::MqttConfig;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::transport::{InboundMessage, MessageTransport, INBOUND_CHANNEL_CAPACITY};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// [`MessageTransport`] backed by a single broker connection.
///
/// Subscriptions are remembered and replayed on every `ConnAck`, so they
/// survive reconnects.
pub struct MqttTransport {
    client: AsyncClient,
    tx: broadcast::Sender<InboundMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop. Must be called inside a
    /// tokio runtime.
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_max_packet_size(1024 * 1024, 1024 * 1024);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let subscriptions: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let loop_client = client.clone();
        let loop_tx = tx.clone();
        let loop_subscriptions = subscriptions.clone();
        let loop_connected = connected.clone();
        let loop_running = running.clone();
        let broker = format!("{}:{}", config.host, config.port);

        tokio::spawn(async move {
            let mut error_count = 0;

            while loop_running.load(Ordering::SeqCst) {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        error_count = 0;
                        let _ = loop_tx.send(InboundMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        error_count = 0;
                        loop_connected.store(true, Ordering::SeqCst);
                        info!(broker = %broker, "MQTT connection acknowledged");

                        let patterns = loop_subscriptions.lock().clone();
                        for pattern in patterns {
                            if let Err(e) = loop_client.subscribe(&pattern, QoS::AtLeastOnce).await {
                                warn!(broker = %broker, pattern = %pattern, error = %e, "Resubscribe failed");
                            }
                        }
                    }
                    Ok(_) => {
                        error_count = 0;
                    }
                    Err(e) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        error_count += 1;
                        let delay = if error_count >= MAX_CONSECUTIVE_ERRORS {
                            error!(
                                broker = %broker,
                                errors = error_count,
                                error = %e,
                                "MQTT broker unreachable, backing off"
                            );
                            error_count = 0;
                            Duration::from_secs(5)
                        } else {
                            warn!(
                                "MQTT broker {} error ({}/{}): {}",
                                broker, error_count, MAX_CONSECUTIVE_ERRORS, e
                            );
                            Duration::from_secs(1)
                        };
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            loop_connected.store(false, Ordering::SeqCst);
            info!(broker = %broker, "MQTT connection closed");
        });

        info!(
            category = "devices",
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "MQTT transport started"
        );

        Self {
            client,
            tx,
            subscriptions,
            connected,
            running,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the event loop and close the connection.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
    }
}

#[async_trait]
impl MessageTransport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.iter().any(|p| p == pattern) {
                subscriptions.push(pattern.to_string());
            }
        }
        // Before the first ConnAck the request is queued by the client and
        // the pattern is replayed on connect anyway.
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    fn incoming(&self) -> broadcast::Receiver<InboundMessage> {
        self.tx.subscribe()
    }
}
