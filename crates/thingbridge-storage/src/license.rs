//! License store using redb.
//!
//! Records are JSON values in string-keyed tables. redb allows one write
//! transaction at a time, so concurrent provisioning of the same hardware
//! is serialized by [`LicenseStore::begin`] rather than by callers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::records::{DeviceInstance, DeviceModel, HardwareIdentity, LicenseQuota, Partner};
use crate::{Error, Result};

// Partners: key = partner code
pub(crate) const PARTNERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("partners");

// Device models: key = model code
pub(crate) const MODELS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("device_models");

// Quotas: key = (partner code, model code)
pub(crate) const QUOTAS_TABLE: TableDefinition<(&str, &str), &str> =
    TableDefinition::new("license_quotas");

// Hardware identities: key = physical identifier
const HARDWARE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("hardware_registry");

// Device instances: key = device id, value includes features
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// Token index: key = current device token, value = device id
const TOKENS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("device_tokens");

// System configuration rows
pub(crate) const SYSTEM_CONFIG_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("system_config");

pub(crate) fn get_json<T, R>(table: &R, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static str>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn get_quota<R>(table: &R, partner: &str, model: &str) -> Result<Option<LicenseQuota>>
where
    R: ReadableTable<(&'static str, &'static str), &'static str>,
{
    match table.get((partner, model))? {
        Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn list_json<T, R>(table: &R) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static str>,
{
    let mut items = Vec::new();
    for entry in table.iter()? {
        let (_key, value) = entry?;
        items.push(serde_json::from_str(value.value())?);
    }
    Ok(items)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Relational store of tenants, models, quotas, hardware and devices.
pub struct LicenseStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl LicenseStore {
    /// Open or create a store at the given path.
    ///
    /// `":memory:"` opens a throwaway file in the system temp directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = if path.as_ref() == Path::new(":memory:") {
            std::env::temp_dir().join(format!("thingbridge_{}.redb", uuid::Uuid::new_v4()))
        } else {
            path.as_ref().to_path_buf()
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => Error::Locked(path.display().to_string()),
            other => other.into(),
        })?;

        let write_txn = db.begin_write()?;
        {
            let _partners = write_txn.open_table(PARTNERS_TABLE)?;
            let _models = write_txn.open_table(MODELS_TABLE)?;
            let _quotas = write_txn.open_table(QUOTAS_TABLE)?;
            let _hardware = write_txn.open_table(HARDWARE_TABLE)?;
            let _devices = write_txn.open_table(DEVICES_TABLE)?;
            let _tokens = write_txn.open_table(TOKENS_TABLE)?;
            let _config = write_txn.open_table(SYSTEM_CONFIG_TABLE)?;
        }
        write_txn.commit()?;

        debug!(category = "storage", path = %path.display(), "License store opened");
        Ok(Arc::new(Self {
            db: Arc::new(db),
            path,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a write transaction. Blocks while another writer is active.
    pub fn begin(&self) -> Result<LicenseTxn> {
        Ok(LicenseTxn {
            txn: self.db.begin_write()?,
        })
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Run `f` against the store on the blocking thread pool.
    ///
    /// redb calls do disk I/O and may wait for the writer lock, so async
    /// callers go through here instead of calling the store directly.
    /// `f` may fail with a storage error or with any error that converts
    /// into the core one.
    pub async fn blocking<T, E, F>(self: &Arc<Self>, f: F) -> thingbridge_core::Result<T>
    where
        F: FnOnce(&LicenseStore) -> std::result::Result<T, E> + Send + 'static,
        E: Into<thingbridge_core::Error> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || f(&store)).await?;
        result.map_err(Into::into)
    }

    // ========== Reads ==========

    pub fn partner(&self, code: &str) -> Result<Option<Partner>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PARTNERS_TABLE)?;
        get_json(&table, code)
    }

    pub fn model(&self, code: &str) -> Result<Option<DeviceModel>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MODELS_TABLE)?;
        get_json(&table, code)
    }

    pub fn quota(&self, partner: &str, model: &str) -> Result<Option<LicenseQuota>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUOTAS_TABLE)?;
        get_quota(&table, partner, model)
    }

    pub fn hardware(&self, physical_id: &str) -> Result<Option<HardwareIdentity>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HARDWARE_TABLE)?;
        get_json(&table, physical_id)
    }

    pub fn device(&self, device_id: &str) -> Result<Option<DeviceInstance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;
        get_json(&table, device_id)
    }

    /// Resolve a token to its live device. Rotated tokens resolve to `None`.
    pub fn device_by_token(&self, token: &str) -> Result<Option<DeviceInstance>> {
        let read_txn = self.db.begin_read()?;
        let tokens = read_txn.open_table(TOKENS_TABLE)?;
        let device_id = match tokens.get(token)? {
            Some(id) => id.value().to_string(),
            None => return Ok(None),
        };
        let devices = read_txn.open_table(DEVICES_TABLE)?;
        get_json(&devices, &device_id)
    }

    pub fn devices_for_owner(&self, owner_id: &str) -> Result<Vec<DeviceInstance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;
        let devices: Vec<DeviceInstance> = list_json(&table)?;
        Ok(devices.into_iter().filter(|d| d.is_owned_by(owner_id)).collect())
    }

    pub fn device_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;
        let mut count = 0;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn system_config(&self, key: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SYSTEM_CONFIG_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    // ========== Writes ==========

    /// Record that a device was heard from. Returns `false` for a token
    /// that no longer belongs to a device.
    pub fn touch_last_seen(&self, token: &str, online: bool, seen_at: DateTime<Utc>) -> Result<bool> {
        let txn = self.begin()?;
        let Some(mut device) = txn.device_by_token(token)? else {
            txn.abort()?;
            return Ok(false);
        };
        device.online = online;
        device.last_seen = Some(seen_at);
        txn.put_device(&device)?;
        txn.commit()?;
        Ok(true)
    }
}

/// Explicit write-transaction handle threaded through provisioning.
///
/// Dropping it without [`LicenseTxn::commit`] discards every change.
pub struct LicenseTxn {
    txn: WriteTransaction,
}

impl LicenseTxn {
    pub fn partner(&self, code: &str) -> Result<Option<Partner>> {
        let table = self.txn.open_table(PARTNERS_TABLE)?;
        get_json(&table, code)
    }

    pub fn put_partner(&self, partner: &Partner) -> Result<()> {
        let mut table = self.txn.open_table(PARTNERS_TABLE)?;
        table.insert(partner.code.as_str(), to_json(partner)?.as_str())?;
        Ok(())
    }

    pub fn model(&self, code: &str) -> Result<Option<DeviceModel>> {
        let table = self.txn.open_table(MODELS_TABLE)?;
        get_json(&table, code)
    }

    pub fn put_model(&self, model: &DeviceModel) -> Result<()> {
        let mut table = self.txn.open_table(MODELS_TABLE)?;
        table.insert(model.code.as_str(), to_json(model)?.as_str())?;
        Ok(())
    }

    pub fn quota(&self, partner: &str, model: &str) -> Result<Option<LicenseQuota>> {
        let table = self.txn.open_table(QUOTAS_TABLE)?;
        get_quota(&table, partner, model)
    }

    pub fn put_quota(&self, quota: &LicenseQuota) -> Result<()> {
        let mut table = self.txn.open_table(QUOTAS_TABLE)?;
        table.insert(
            (quota.partner_code.as_str(), quota.model_code.as_str()),
            to_json(quota)?.as_str(),
        )?;
        Ok(())
    }

    pub fn hardware(&self, physical_id: &str) -> Result<Option<HardwareIdentity>> {
        let table = self.txn.open_table(HARDWARE_TABLE)?;
        get_json(&table, physical_id)
    }

    pub fn put_hardware(&self, hardware: &HardwareIdentity) -> Result<()> {
        let mut table = self.txn.open_table(HARDWARE_TABLE)?;
        table.insert(hardware.physical_id.as_str(), to_json(hardware)?.as_str())?;
        Ok(())
    }

    pub fn device(&self, device_id: &str) -> Result<Option<DeviceInstance>> {
        let table = self.txn.open_table(DEVICES_TABLE)?;
        get_json(&table, device_id)
    }

    pub fn device_by_token(&self, token: &str) -> Result<Option<DeviceInstance>> {
        let device_id = {
            let tokens = self.txn.open_table(TOKENS_TABLE)?;
            let id = tokens.get(token)?.map(|v| v.value().to_string());
            id
        };
        match device_id {
            Some(id) => self.device(&id),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a device and index its token.
    pub fn put_device(&self, device: &DeviceInstance) -> Result<()> {
        {
            let mut table = self.txn.open_table(DEVICES_TABLE)?;
            table.insert(device.id.as_str(), to_json(device)?.as_str())?;
        }
        let mut tokens = self.txn.open_table(TOKENS_TABLE)?;
        tokens.insert(device.token.as_str(), device.id.as_str())?;
        Ok(())
    }

    /// Delete a device, its features and its token index entry.
    pub fn remove_device(&self, device_id: &str) -> Result<Option<DeviceInstance>> {
        let removed: Option<DeviceInstance> = {
            let mut table = self.txn.open_table(DEVICES_TABLE)?;
            let json = table.remove(device_id)?.map(|v| v.value().to_string());
            match json {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            }
        };
        if let Some(device) = &removed {
            let mut tokens = self.txn.open_table(TOKENS_TABLE)?;
            tokens.remove(device.token.as_str())?;
        }
        Ok(removed)
    }

    pub fn system_config(&self, key: &str) -> Result<Option<String>> {
        let table = self.txn.open_table(SYSTEM_CONFIG_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    pub fn set_system_config(&self, key: &str, value: &str) -> Result<()> {
        let mut table = self.txn.open_table(SYSTEM_CONFIG_TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Make every change visible atomically.
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    /// Discard every change.
    pub fn abort(self) -> Result<()> {
        self.txn.abort()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{FeatureBlueprint, FeatureType, Placement, Protocol};

    fn open_temp() -> (tempfile::TempDir, Arc<LicenseStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::open(dir.path().join("license.redb")).unwrap();
        (dir, store)
    }

    fn sample_device(token: &str) -> DeviceInstance {
        let model = DeviceModel::new("RELAY", "Relay", Protocol::Mqtt)
            .with_feature(FeatureBlueprint::new("relay_1", "Relay 1", FeatureType::Binary));
        let now = Utc::now();
        let hardware = HardwareIdentity {
            physical_id: "AA".into(),
            partner_code: "ACME".into(),
            model_code: "RELAY".into(),
            device_token: token.into(),
            device_id: None,
            banned: false,
            registered_at: now,
            activated_at: now,
        };
        DeviceInstance::from_blueprint(&hardware, &model, "u1", "Relay", Protocol::Mqtt, Placement::default())
    }

    #[test]
    fn test_second_open_reports_lock() {
        let (dir, _store) = open_temp();
        let Err(err) = LicenseStore::open(dir.path().join("license.redb")) else {
            panic!("second open should fail while the first handle is alive");
        };
        assert!(matches!(err, Error::Locked(ref p) if p.ends_with("license.redb")));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let (_dir, store) = open_temp();
        {
            let txn = store.begin().unwrap();
            txn.put_quota(&LicenseQuota::new("ACME", "RELAY", 5)).unwrap();
            // dropped without commit
        }
        assert!(store.quota("ACME", "RELAY").unwrap().is_none());

        let txn = store.begin().unwrap();
        txn.put_quota(&LicenseQuota::new("ACME", "RELAY", 5)).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.quota("ACME", "RELAY").unwrap().unwrap().max_quantity, 5);
    }

    #[test]
    fn test_token_index_follows_device() {
        let (_dir, store) = open_temp();
        let device = sample_device("tok-1");

        let txn = store.begin().unwrap();
        txn.put_device(&device).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.device_by_token("tok-1").unwrap().unwrap().id, device.id);

        let txn = store.begin().unwrap();
        let removed = txn.remove_device(&device.id).unwrap();
        txn.commit().unwrap();

        assert_eq!(removed.unwrap().token, "tok-1");
        assert!(store.device_by_token("tok-1").unwrap().is_none());
        assert!(store.device(&device.id).unwrap().is_none());
    }

    #[test]
    fn test_touch_last_seen() {
        let (_dir, store) = open_temp();
        let device = sample_device("tok-2");
        let txn = store.begin().unwrap();
        txn.put_device(&device).unwrap();
        txn.commit().unwrap();

        let at = Utc::now();
        assert!(store.touch_last_seen("tok-2", true, at).unwrap());
        let reloaded = store.device(&device.id).unwrap().unwrap();
        assert!(reloaded.online);
        assert_eq!(reloaded.last_seen, Some(at));

        assert!(!store.touch_last_seen("unknown", true, at).unwrap());
    }

    #[tokio::test]
    async fn test_blocking_maps_errors() {
        let (_dir, store) = open_temp();
        let found = store.blocking(|s| s.partner("ACME")).await.unwrap();
        assert!(found.is_none());

        let err = store
            .blocking(|_| -> Result<()> { Err(crate::Error::Conflict("partner ACME".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, thingbridge_core::Error::Conflict(_)));
    }

    #[test]
    fn test_memory_path() {
        let store = LicenseStore::open(":memory:").unwrap();
        assert!(store.path().starts_with(std::env::temp_dir()));
        assert_eq!(store.device_count().unwrap(), 0);
    }
}
