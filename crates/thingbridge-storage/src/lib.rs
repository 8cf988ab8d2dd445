//! Storage layer for ThingBridge.
//!
//! - [`LicenseStore`]: the relational record of partners, device models,
//!   license quotas, hardware identities and device instances, on redb.
//!   Multi-step mutations go through an explicit [`LicenseTxn`].
//! - [`MemoryStateStore`]: in-process [`thingbridge_core::StateStore`] for
//!   online status and shadow hashes.

pub mod admin;
pub mod error;
pub mod license;
pub mod records;
pub mod state;

pub use admin::{ModelUsage, PartnerUsage};
pub use error::{Error, Result};
pub use license::{LicenseStore, LicenseTxn};
pub use records::{
    DeviceFeature, DeviceInstance, DeviceModel, FeatureBlueprint, FeatureEncoding, FeatureType,
    HardwareIdentity, LicenseQuota, Partner, Placement, Protocol,
};
pub use state::MemoryStateStore;
