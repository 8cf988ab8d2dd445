//! Administrative operations: partners, models, quotas, system settings.

use std::collections::HashSet;

use chrono::Utc;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use thingbridge_core::config::system_keys;
use tracing::info;

use crate::license::{
    get_json, list_json, LicenseStore, MODELS_TABLE, PARTNERS_TABLE, QUOTAS_TABLE,
};
use crate::records::{DeviceModel, LicenseQuota, Partner};
use crate::{Error, Result};

/// Quota consumption for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub model_code: String,
    pub model_name: String,
    pub used: u32,
    pub total: u32,
}

/// Quota consumption for one partner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartnerUsage {
    pub partner_code: String,
    pub partner_name: String,
    pub quotas: Vec<ModelUsage>,
}

fn require_code(kind: &str, code: &str) -> Result<String> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} code must not be empty")));
    }
    Ok(code.to_string())
}

impl LicenseStore {
    pub fn create_partner(&self, code: &str, name: &str) -> Result<Partner> {
        let code = require_code("partner", code)?;
        let txn = self.begin()?;
        if txn.partner(&code)?.is_some() {
            return Err(Error::Conflict(format!("partner {code}")));
        }

        let partner = Partner {
            code,
            name: name.to_string(),
            active: true,
            created_at: Utc::now(),
        };
        txn.put_partner(&partner)?;
        txn.commit()?;

        info!(category = "admin", partner = %partner.code, "Partner created");
        Ok(partner)
    }

    /// Rename and/or (de)activate a partner.
    pub fn update_partner(&self, code: &str, name: Option<&str>, active: Option<bool>) -> Result<Partner> {
        let txn = self.begin()?;
        let mut partner = txn
            .partner(code)?
            .ok_or_else(|| Error::NotFound(format!("partner {code}")))?;
        if let Some(name) = name {
            partner.name = name.to_string();
        }
        if let Some(active) = active {
            partner.active = active;
        }
        txn.put_partner(&partner)?;
        txn.commit()?;
        Ok(partner)
    }

    pub fn create_model(&self, mut model: DeviceModel) -> Result<DeviceModel> {
        model.code = require_code("model", &model.code)?;

        let mut seen = HashSet::new();
        for feature in &model.features {
            if !seen.insert(feature.code.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate feature {} in model {}",
                    feature.code, model.code
                )));
            }
        }

        let txn = self.begin()?;
        if txn.model(&model.code)?.is_some() {
            return Err(Error::Conflict(format!("model {}", model.code)));
        }
        txn.put_model(&model)?;
        txn.commit()?;

        info!(
            category = "admin",
            model = %model.code,
            protocol = %model.protocol,
            features = model.features.len(),
            "Device model created"
        );
        Ok(model)
    }

    /// Create or resize the quota for a (partner, model) pair.
    pub fn upsert_quota(
        &self,
        partner_code: &str,
        model_code: &str,
        max_quantity: u32,
        active: bool,
    ) -> Result<LicenseQuota> {
        let partner_code = partner_code.trim();
        let model_code = model_code.trim();
        let txn = self.begin()?;
        if txn.partner(partner_code)?.is_none() {
            return Err(Error::NotFound(format!("partner {partner_code}")));
        }
        if txn.model(model_code)?.is_none() {
            return Err(Error::NotFound(format!("model {model_code}")));
        }

        let mut quota = txn
            .quota(partner_code, model_code)?
            .unwrap_or_else(|| LicenseQuota::new(partner_code, model_code, 0));

        if active && max_quantity < quota.activated_count {
            return Err(Error::InvalidInput(format!(
                "max quantity {} is below the {} units already activated",
                max_quantity, quota.activated_count
            )));
        }

        quota.max_quantity = max_quantity;
        quota.active = active;
        quota.updated_at = Utc::now();
        txn.put_quota(&quota)?;
        txn.commit()?;

        info!(
            category = "admin",
            partner = partner_code,
            model = model_code,
            max_quantity,
            active,
            "Quota updated"
        );
        Ok(quota)
    }

    pub fn list_partners(&self) -> Result<Vec<Partner>> {
        let read_txn = self.database().begin_read()?;
        let table = read_txn.open_table(PARTNERS_TABLE)?;
        list_json(&table)
    }

    pub fn list_models(&self) -> Result<Vec<DeviceModel>> {
        let read_txn = self.database().begin_read()?;
        let table = read_txn.open_table(MODELS_TABLE)?;
        list_json(&table)
    }

    pub fn list_quotas(&self) -> Result<Vec<LicenseQuota>> {
        let read_txn = self.database().begin_read()?;
        let table = read_txn.open_table(QUOTAS_TABLE)?;
        let mut quotas = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            quotas.push(serde_json::from_str(value.value())?);
        }
        Ok(quotas)
    }

    /// Used/total per model for every partner, partners in code order.
    pub fn partners_usage(&self) -> Result<Vec<PartnerUsage>> {
        let read_txn = self.database().begin_read()?;
        let partners: Vec<Partner> = list_json(&read_txn.open_table(PARTNERS_TABLE)?)?;
        let models = read_txn.open_table(MODELS_TABLE)?;
        let quotas = self.list_quotas()?;

        let mut usage = Vec::with_capacity(partners.len());
        for partner in partners {
            let mut entries = Vec::new();
            for quota in quotas.iter().filter(|q| q.partner_code == partner.code) {
                let model: Option<DeviceModel> = get_json(&models, &quota.model_code)?;
                entries.push(ModelUsage {
                    model_code: quota.model_code.clone(),
                    model_name: model.map(|m| m.name).unwrap_or_default(),
                    used: quota.activated_count,
                    total: quota.max_quantity,
                });
            }
            usage.push(PartnerUsage {
                partner_code: partner.code,
                partner_name: partner.name,
                quotas: entries,
            });
        }
        Ok(usage)
    }

    pub fn set_system_config(&self, key: &str, value: &str) -> Result<()> {
        let key = require_code("config", key)?;
        let txn = self.begin()?;
        txn.set_system_config(&key, value)?;
        txn.commit()?;
        Ok(())
    }

    /// Broker settings handed to devices at provisioning time.
    pub fn set_mqtt_config(&self, host: &str, user: &str, pass: &str) -> Result<()> {
        let txn = self.begin()?;
        txn.set_system_config(system_keys::MQTT_HOST, host)?;
        txn.set_system_config(system_keys::MQTT_USER, user)?;
        txn.set_system_config(system_keys::MQTT_PASS, pass)?;
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{FeatureBlueprint, FeatureType, Protocol};
    use std::sync::Arc;

    fn open_temp() -> (tempfile::TempDir, Arc<LicenseStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::open(dir.path().join("admin.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_partner_code_is_unique() {
        let (_dir, store) = open_temp();
        store.create_partner("ACME", "Acme Corp").unwrap();
        let err = store.create_partner("ACME", "Other").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(matches!(store.create_partner("  ", "x"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_update_partner() {
        let (_dir, store) = open_temp();
        store.create_partner("ACME", "Acme").unwrap();
        let updated = store.update_partner("ACME", Some("Acme Ltd"), Some(false)).unwrap();
        assert_eq!(updated.name, "Acme Ltd");
        assert!(!updated.active);
        assert!(matches!(
            store.update_partner("NOPE", None, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_model_rejects_duplicate_features() {
        let (_dir, store) = open_temp();
        let model = DeviceModel::new("RELAY", "Relay", Protocol::Mqtt)
            .with_feature(FeatureBlueprint::new("relay_1", "A", FeatureType::Binary))
            .with_feature(FeatureBlueprint::new("relay_1", "B", FeatureType::Binary));
        assert!(matches!(store.create_model(model), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_model_code_is_stored_trimmed() {
        let (_dir, store) = open_temp();
        let model = store
            .create_model(DeviceModel::new(" RELAY ", "Relay", Protocol::Mqtt))
            .unwrap();
        assert_eq!(model.code, "RELAY");
        assert!(store.model("RELAY").unwrap().is_some());
        assert!(matches!(
            store.create_model(DeviceModel::new("RELAY", "Again", Protocol::Mqtt)),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_list_quotas() {
        let (_dir, store) = open_temp();
        assert!(store.list_quotas().unwrap().is_empty());

        store.create_partner("ACME", "Acme").unwrap();
        store
            .create_model(DeviceModel::new("RELAY", "Relay", Protocol::Mqtt))
            .unwrap();
        store.upsert_quota(" ACME", "RELAY ", 4, true).unwrap();

        let quotas = store.list_quotas().unwrap();
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas[0].partner_code, "ACME");
        assert_eq!(quotas[0].model_code, "RELAY");
        assert_eq!(quotas[0].max_quantity, 4);
    }

    #[test]
    fn test_upsert_quota_requires_known_codes() {
        let (_dir, store) = open_temp();
        store.create_partner("ACME", "Acme").unwrap();
        assert!(matches!(
            store.upsert_quota("ACME", "GHOST", 5, true),
            Err(Error::NotFound(_))
        ));

        store
            .create_model(DeviceModel::new("RELAY", "Relay", Protocol::Mqtt))
            .unwrap();
        let quota = store.upsert_quota("ACME", "RELAY", 5, true).unwrap();
        assert_eq!(quota.max_quantity, 5);
        assert_eq!(quota.activated_count, 0);

        let resized = store.upsert_quota("ACME", "RELAY", 2, true).unwrap();
        assert_eq!(resized.max_quantity, 2);
    }

    #[test]
    fn test_quota_cannot_shrink_below_activated() {
        let (_dir, store) = open_temp();
        store.create_partner("ACME", "Acme").unwrap();
        store
            .create_model(DeviceModel::new("RELAY", "Relay", Protocol::Mqtt))
            .unwrap();
        store.upsert_quota("ACME", "RELAY", 3, true).unwrap();

        let txn = store.begin().unwrap();
        let mut quota = txn.quota("ACME", "RELAY").unwrap().unwrap();
        quota.activated_count = 2;
        txn.put_quota(&quota).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            store.upsert_quota("ACME", "RELAY", 1, true),
            Err(Error::InvalidInput(_))
        ));
        // Deactivating is always allowed
        assert!(store.upsert_quota("ACME", "RELAY", 1, false).is_ok());
    }

    #[test]
    fn test_partners_usage() {
        let (_dir, store) = open_temp();
        store.create_partner("ACME", "Acme").unwrap();
        store.create_partner("BETA", "Beta").unwrap();
        store
            .create_model(DeviceModel::new("RELAY", "Smart Relay", Protocol::Mqtt))
            .unwrap();
        store.upsert_quota("ACME", "RELAY", 10, true).unwrap();

        let usage = store.partners_usage().unwrap();
        assert_eq!(usage.len(), 2);
        let acme = usage.iter().find(|u| u.partner_code == "ACME").unwrap();
        assert_eq!(
            acme.quotas,
            vec![ModelUsage {
                model_code: "RELAY".into(),
                model_name: "Smart Relay".into(),
                used: 0,
                total: 10,
            }]
        );
        let beta = usage.iter().find(|u| u.partner_code == "BETA").unwrap();
        assert!(beta.quotas.is_empty());
    }

    #[test]
    fn test_mqtt_config_rows() {
        let (_dir, store) = open_temp();
        store.set_mqtt_config("mqtt.example.com", "svc", "secret").unwrap();
        assert_eq!(
            store.system_config(system_keys::MQTT_HOST).unwrap().as_deref(),
            Some("mqtt.example.com")
        );
        assert_eq!(store.system_config(system_keys::MQTT_PASS).unwrap().as_deref(), Some("secret"));
        assert!(store.system_config("MISSING").unwrap().is_none());
    }
}
