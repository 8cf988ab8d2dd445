//! Device-facing plumbing for ThingBridge.
//!
//! - [`DeviceDriver`] implementations encode a feature value for a transport
//!   protocol and publish it; [`DriverRegistry`] maps every [`Protocol`] to
//!   its driver.
//! - [`MessageTransport`] is the pub/sub seam: [`MemoryTransport`] in
//!   process, `MqttTransport` against a real broker.
//! - [`ShadowReconciler`] ingests status and state messages from devices
//!   into the shadow store.

pub mod driver;
pub mod drivers;
pub mod encoding;
pub mod error;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod reconciler;
pub mod registry;
pub mod transport;

pub use driver::DeviceDriver;
pub use drivers::{MqttDriver, ZigbeeDriver};
pub use error::{DriverError, TransportError};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use reconciler::{
    extract_token, DiscardReason, LastSeenUpdate, MessageOutcome, ShadowReconciler,
    INBOUND_SUBSCRIPTIONS,
};
pub use registry::{AnyDriver, DriverRegistry};
pub use transport::{topic_matches, InboundMessage, MemoryTransport, MessageTransport};

pub use thingbridge_storage::Protocol;
