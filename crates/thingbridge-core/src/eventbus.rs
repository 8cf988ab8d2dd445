//! Real-time fan-out of device events.
//!
//! Delivery is best-effort and at-most-once: events published while nobody
//! is subscribed are dropped, and a subscriber that falls behind the
//! channel capacity skips the oldest events.

use tokio::sync::broadcast;

use crate::event::{DeviceEvent, EventMetadata};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast bus scoped by per-device rooms.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(DeviceEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event to its device room.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: DeviceEvent, source: &str) -> bool {
        let metadata = EventMetadata::new(event.room(), source);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to every room.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to a single room, e.g. `device_<token>`.
    pub fn subscribe_room(&self, room: impl Into<String>) -> FilteredReceiver {
        let room = room.into();
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter: Box::new(move |_, meta| meta.room == room),
        }
    }

    /// Subscribe to events matching a predicate.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver
    where
        F: Fn(&DeviceEvent, &EventMetadata) -> bool + Send + Sync + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter: Box::new(filter),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(DeviceEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

type EventPredicate = Box<dyn Fn(&DeviceEvent, &EventMetadata) -> bool + Send + Sync>;

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver {
    rx: broadcast::Receiver<(DeviceEvent, EventMetadata)>,
    filter: EventPredicate,
}

impl FilteredReceiver {
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event, &meta) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) => {
                    if (self.filter)(&event, &meta) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
