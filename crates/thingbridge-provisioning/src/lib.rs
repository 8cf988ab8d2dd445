//! Quota-gated hardware provisioning for ThingBridge.
//!
//! Turns a physical-identifier claim into a licensed device identity:
//! first registration consumes a unit of the (tenant, model) quota,
//! re-registration is free, and moving hardware to another tenant or model
//! rotates its token so the previous owner loses control.

pub mod credentials;
pub mod manager;
pub mod transport_config;

pub use credentials::{generate_token, open_credentials, seal_credentials};
pub use manager::{
    load_refund_policy, ProvisionOutcome, ProvisionRequest, ProvisionResult, ProvisioningManager,
};
pub use transport_config::{BrokerSettings, TransportConfig};
