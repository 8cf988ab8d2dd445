//! License & provisioning manager.
//!
//! Every decision about a claim (new unit, re-registration, re-claim,
//! transfer) is taken inside one redb write transaction that also moves
//! the quota counters. redb admits a single writer, so two claims for the
//! same physical identifier serialize there: the second sees the first's
//! committed hardware row and takes the idempotent path.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thingbridge_core::config::system_keys;
use thingbridge_core::state::keys;
use thingbridge_core::{Error, QuotaRefundPolicy, Result, StateStore};
use thingbridge_storage::{
    DeviceInstance, DeviceModel, HardwareIdentity, LicenseStore, LicenseTxn, Partner, Placement,
    Protocol,
};
use tracing::{debug, info, warn};

use crate::credentials::generate_token;
use crate::transport_config::{BrokerSettings, TransportConfig};

/// A device asking to be licensed and bound to an owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRequest {
    /// MAC, IMEI or serial; trimmed and upper-cased before use
    pub physical_id: String,
    pub tenant_code: String,
    pub model_code: String,
    pub owner_id: String,
    #[serde(default)]
    pub placement: Placement,
    /// Defaults to the physical identifier
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to the model's protocol
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

impl ProvisionRequest {
    pub fn new(
        physical_id: impl Into<String>,
        tenant_code: impl Into<String>,
        model_code: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            physical_id: physical_id.into(),
            tenant_code: tenant_code.into(),
            model_code: model_code.into(),
            owner_id: owner_id.into(),
            placement: Placement::default(),
            name: None,
            protocol: None,
        }
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn normalized(mut self) -> Result<Self> {
        self.physical_id = self.physical_id.trim().to_uppercase();
        self.tenant_code = self.tenant_code.trim().to_string();
        self.model_code = self.model_code.trim().to_string();
        self.owner_id = self.owner_id.trim().to_string();

        for (field, value) in [
            ("physical identifier", &self.physical_id),
            ("tenant code", &self.tenant_code),
            ("model code", &self.model_code),
            ("owner id", &self.owner_id),
        ] {
            if value.is_empty() {
                return Err(Error::validation(format!("{field} is required")));
            }
        }
        Ok(self)
    }
}

/// Which path a claim took.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// First registration; one quota unit consumed.
    Registered,
    /// Same tenant, model and owner; nothing changed.
    Existing,
    /// Same tenant and model, new owner; token rotated, quota untouched.
    Reclaimed,
    /// Different tenant or model; token rotated, new quota consumed.
    Transferred,
}

/// Credentials and self-configuration for the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionResult {
    pub device_token: String,
    pub device_id: String,
    pub outcome: ProvisionOutcome,
    pub transport_config: TransportConfig,
}

/// What the write transaction produced.
struct Claim {
    hardware: HardwareIdentity,
    device: DeviceInstance,
    outcome: ProvisionOutcome,
    /// Token whose shadow must be cleared once the change is visible
    retired_token: Option<String>,
    broker_host: Option<String>,
    broker_user: Option<String>,
    broker_pass: Option<String>,
}

/// Licenses hardware and binds it to owners.
pub struct ProvisioningManager {
    store: Arc<LicenseStore>,
    state: Arc<dyn StateStore>,
    refund: QuotaRefundPolicy,
    broker: BrokerSettings,
}

impl ProvisioningManager {
    pub fn new(
        store: Arc<LicenseStore>,
        state: Arc<dyn StateStore>,
        refund: QuotaRefundPolicy,
        broker: BrokerSettings,
    ) -> Self {
        Self {
            store,
            state,
            refund,
            broker,
        }
    }

    pub fn refund_policy(&self) -> QuotaRefundPolicy {
        self.refund
    }

    /// Claim a physical unit for `owner_id` under `tenant_code`/`model_code`.
    ///
    /// # Errors
    ///
    /// `Validation` for missing identifiers, `NotFound` for an unknown
    /// tenant or model and `QuotaExceeded` when the target quota is missing,
    /// inactive or used up. Nothing is written on error.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResult> {
        let request = request.normalized()?;
        let refund = self.refund;
        let claim = self
            .store
            .blocking(move |store| claim_hardware(store, &request, refund))
            .await?;

        if let Some(token) = &claim.retired_token {
            self.clear_shadow(token).await;
        }

        let broker = self.broker.clone().with_overrides(
            claim.broker_host,
            claim.broker_user,
            claim.broker_pass,
        );
        let transport_config = TransportConfig::for_hardware(&broker, &claim.hardware)?;

        info!(
            category = "provisioning",
            physical_id = %claim.hardware.physical_id,
            tenant = %claim.hardware.partner_code,
            model = %claim.hardware.model_code,
            device_id = %claim.device.id,
            outcome = ?claim.outcome,
            "Hardware provisioned"
        );

        Ok(ProvisionResult {
            device_token: claim.hardware.device_token,
            device_id: claim.device.id,
            outcome: claim.outcome,
            transport_config,
        })
    }

    /// Drop the status flag and shadow hash of a retired token. The token
    /// no longer resolves to a device, so nothing can write them back.
    async fn clear_shadow(&self, token: &str) {
        for key in [keys::status(token), keys::shadow(token)] {
            if let Err(e) = self.state.del(&key).await {
                warn!(category = "provisioning", key = %key, error = %e, "Failed to clear retired shadow key");
            }
        }
        debug!(category = "provisioning", "Retired token shadow cleared");
    }
}

/// Refund policy in effect: the `REFUND_QUOTA_ON_TRANSFER` row when an
/// administrator has set one, otherwise `configured`.
pub async fn load_refund_policy(
    store: &Arc<LicenseStore>,
    configured: QuotaRefundPolicy,
) -> Result<QuotaRefundPolicy> {
    let row = store
        .blocking(|s| s.system_config(system_keys::REFUND_QUOTA_ON_TRANSFER))
        .await?;
    match row {
        Some(value) => value.parse(),
        None => Ok(configured),
    }
}

fn claim_hardware(
    store: &LicenseStore,
    request: &ProvisionRequest,
    refund: QuotaRefundPolicy,
) -> Result<Claim> {
    let txn = store.begin()?;

    let partner = txn
        .partner(&request.tenant_code)?
        .ok_or_else(|| Error::not_found(format!("tenant {}", request.tenant_code)))?;
    let model = txn
        .model(&request.model_code)?
        .ok_or_else(|| Error::not_found(format!("model {}", request.model_code)))?;

    let (hardware, device, outcome, retired_token) = match txn.hardware(&request.physical_id)? {
        None => register(&txn, request, &partner, &model)?,
        Some(hardware)
            if hardware.partner_code == partner.code && hardware.model_code == model.code =>
        {
            let current = match &hardware.device_id {
                Some(id) => txn.device(id)?,
                None => None,
            };
            match current {
                Some(device) if device.is_owned_by(&request.owner_id) => {
                    (hardware, device, ProvisionOutcome::Existing, None)
                }
                previous => reclaim(&txn, request, &model, hardware, previous)?,
            }
        }
        Some(hardware) => transfer(&txn, request, &partner, &model, hardware, refund)?,
    };

    let broker_host = txn.system_config(system_keys::MQTT_HOST)?;
    let broker_user = txn.system_config(system_keys::MQTT_USER)?;
    let broker_pass = txn.system_config(system_keys::MQTT_PASS)?;

    if outcome == ProvisionOutcome::Existing {
        txn.abort()?;
    } else {
        txn.commit()?;
    }

    Ok(Claim {
        hardware,
        device,
        outcome,
        retired_token,
        broker_host,
        broker_user,
        broker_pass,
    })
}

type ClaimParts = (HardwareIdentity, DeviceInstance, ProvisionOutcome, Option<String>);

fn register(
    txn: &LicenseTxn,
    request: &ProvisionRequest,
    partner: &Partner,
    model: &DeviceModel,
) -> Result<ClaimParts> {
    consume_quota(txn, &partner.code, &model.code)?;

    let now = Utc::now();
    let mut hardware = HardwareIdentity {
        physical_id: request.physical_id.clone(),
        partner_code: partner.code.clone(),
        model_code: model.code.clone(),
        device_token: generate_token(),
        device_id: None,
        banned: false,
        registered_at: now,
        activated_at: now,
    };
    let device = bind_device(txn, request, model, &mut hardware)?;
    Ok((hardware, device, ProvisionOutcome::Registered, None))
}

fn reclaim(
    txn: &LicenseTxn,
    request: &ProvisionRequest,
    model: &DeviceModel,
    mut hardware: HardwareIdentity,
    previous: Option<DeviceInstance>,
) -> Result<ClaimParts> {
    if let Some(previous) = &previous {
        txn.remove_device(&previous.id)?;
    }
    let retired = std::mem::replace(&mut hardware.device_token, generate_token());
    hardware.activated_at = Utc::now();

    let device = bind_device(txn, request, model, &mut hardware)?;
    Ok((hardware, device, ProvisionOutcome::Reclaimed, Some(retired)))
}

fn transfer(
    txn: &LicenseTxn,
    request: &ProvisionRequest,
    partner: &Partner,
    model: &DeviceModel,
    mut hardware: HardwareIdentity,
    refund: QuotaRefundPolicy,
) -> Result<ClaimParts> {
    consume_quota(txn, &partner.code, &model.code)?;
    if refund.refunds() {
        refund_quota(txn, &hardware.partner_code, &hardware.model_code)?;
    }

    if let Some(id) = &hardware.device_id {
        txn.remove_device(id)?;
    }

    let retired = std::mem::replace(&mut hardware.device_token, generate_token());
    info!(
        category = "provisioning",
        physical_id = %hardware.physical_id,
        from_tenant = %hardware.partner_code,
        from_model = %hardware.model_code,
        to_tenant = %partner.code,
        to_model = %model.code,
        refund = refund.refunds(),
        "Transferring hardware"
    );
    hardware.partner_code = partner.code.clone();
    hardware.model_code = model.code.clone();
    hardware.banned = false;
    hardware.activated_at = Utc::now();

    let device = bind_device(txn, request, model, &mut hardware)?;
    Ok((hardware, device, ProvisionOutcome::Transferred, Some(retired)))
}

/// Create the device instance for `hardware` and save both rows.
fn bind_device(
    txn: &LicenseTxn,
    request: &ProvisionRequest,
    model: &DeviceModel,
    hardware: &mut HardwareIdentity,
) -> Result<DeviceInstance> {
    let name = request
        .name
        .clone()
        .unwrap_or_else(|| request.physical_id.clone());
    let protocol = request.protocol.unwrap_or(model.protocol);
    let device = DeviceInstance::from_blueprint(
        hardware,
        model,
        request.owner_id.clone(),
        name,
        protocol,
        request.placement.clone(),
    );

    hardware.device_id = Some(device.id.clone());
    txn.put_hardware(hardware)?;
    txn.put_device(&device)?;
    Ok(device)
}

fn consume_quota(txn: &LicenseTxn, partner_code: &str, model_code: &str) -> Result<()> {
    let mut quota = match txn.quota(partner_code, model_code)? {
        Some(quota) if quota.has_capacity() => quota,
        _ => return Err(Error::quota_exceeded(partner_code, model_code)),
    };
    quota.activated_count += 1;
    quota.updated_at = Utc::now();
    txn.put_quota(&quota)?;
    Ok(())
}

fn refund_quota(txn: &LicenseTxn, partner_code: &str, model_code: &str) -> Result<()> {
    let Some(mut quota) = txn.quota(partner_code, model_code)? else {
        return Ok(());
    };
    if quota.activated_count > 0 {
        quota.activated_count -= 1;
        quota.updated_at = Utc::now();
        txn.put_quota(&quota)?;
    }
    Ok(())
}
