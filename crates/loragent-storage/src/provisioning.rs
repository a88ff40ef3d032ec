//! Typed provisioning store over a [`KeyValueStore`].
//!
//! Groups are keyed by (service, subservice, application_id) and devices by
//! (service, subservice, device_id). Records are stored as JSON.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use loragent_core::model::{Device, Group};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backend::{KeyValueStore, MemoryStore, Table, WriteOp};
use crate::redb_store::RedbStore;
use crate::{Error, Result};

/// Separates key components; cannot appear in service paths or MQTT ids.
const KEY_SEPARATOR: char = '\u{1f}';

fn scope_prefix(service: &str, subservice: &str) -> String {
    format!("{service}{KEY_SEPARATOR}{subservice}{KEY_SEPARATOR}")
}

fn record_key(service: &str, subservice: &str, id: &str) -> String {
    format!("{}{}", scope_prefix(service, subservice), id)
}

fn group_key(group: &Group) -> String {
    record_key(&group.service, &group.subservice, group.application_id())
}

fn device_key(device: &Device) -> String {
    record_key(&device.service, &device.subservice, &device.device_id)
}

/// CRUD for group and device records.
#[derive(Clone)]
pub struct ProvisioningStore {
    backend: Arc<dyn KeyValueStore>,
}

impl ProvisioningStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Ephemeral store; contents are lost when the last clone is dropped.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open or create a redb-backed store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Arc::new(RedbStore::open(path)?)))
    }

    // ========== Groups ==========

    /// Create a group. Fails with `Conflict` if one already exists for the
    /// same (service, subservice, application_id).
    pub fn create_group(&self, group: &Group) -> Result<()> {
        group.validate()?;
        let key = group_key(group);
        let json = serde_json::to_string(group)?;
        if !self.backend.insert_new(Table::Groups, &key, &json)? {
            return Err(Error::Conflict(format!(
                "group {}{} application {}",
                group.service,
                group.subservice,
                group.application_id()
            )));
        }
        debug!(
            category = "provisioning",
            application_id = group.application_id(),
            "Group created"
        );
        Ok(())
    }

    /// Insert or overwrite a group.
    pub fn put_group(&self, group: &Group) -> Result<()> {
        group.validate()?;
        let json = serde_json::to_string(group)?;
        self.backend.put(Table::Groups, &group_key(group), &json)
    }

    /// Replace an existing group (delete + recreate). Devices are kept.
    pub fn replace_group(&self, group: &Group) -> Result<()> {
        group.validate()?;
        let key = group_key(group);
        if self.backend.get(Table::Groups, &key)?.is_none() {
            return Err(Error::NotFound(format!(
                "group {}{} application {}",
                group.service,
                group.subservice,
                group.application_id()
            )));
        }
        let mut replacement = group.clone();
        replacement.created_at = Utc::now();
        let json = serde_json::to_string(&replacement)?;
        self.backend.batch(&[
            WriteOp::Delete {
                table: Table::Groups,
                key: key.clone(),
            },
            WriteOp::Put {
                table: Table::Groups,
                key,
                value: json,
            },
        ])
    }

    pub fn find_group(
        &self,
        service: &str,
        subservice: &str,
        application_id: &str,
    ) -> Result<Option<Group>> {
        let key = record_key(service, subservice, application_id);
        match self.backend.get(Table::Groups, &key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn get_group(&self, service: &str, subservice: &str, application_id: &str) -> Result<Group> {
        self.find_group(service, subservice, application_id)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "group {service}{subservice} application {application_id}"
                ))
            })
    }

    pub fn list_groups(&self, service: &str, subservice: &str) -> Result<Vec<Group>> {
        self.scan(Table::Groups, &scope_prefix(service, subservice))
    }

    /// Every persisted group, across all scopes.
    pub fn list_all_groups(&self) -> Result<Vec<Group>> {
        self.scan(Table::Groups, "")
    }

    /// Delete a group and, in the same transaction, all of its devices.
    pub fn delete_group(
        &self,
        service: &str,
        subservice: &str,
        application_id: &str,
    ) -> Result<Group> {
        let group = self.get_group(service, subservice, application_id)?;

        let mut ops = vec![WriteOp::Delete {
            table: Table::Groups,
            key: group_key(&group),
        }];
        for device in self.list_devices(service, subservice)? {
            if device.application_id == application_id {
                ops.push(WriteOp::Delete {
                    table: Table::Devices,
                    key: device_key(&device),
                });
            }
        }
        debug!(
            category = "provisioning",
            application_id,
            devices = ops.len() - 1,
            "Deleting group"
        );
        self.backend.batch(&ops)?;
        Ok(group)
    }

    // ========== Devices ==========

    /// Create a device. Its group must exist; the device id must be unused
    /// within the scope.
    pub fn create_device(&self, device: &Device) -> Result<()> {
        device.validate()?;
        self.get_group(&device.service, &device.subservice, &device.application_id)?;
        let json = serde_json::to_string(device)?;
        if !self
            .backend
            .insert_new(Table::Devices, &device_key(device), &json)?
        {
            return Err(Error::Conflict(format!(
                "device {} in {}{}",
                device.device_id, device.service, device.subservice
            )));
        }
        Ok(())
    }

    pub fn put_device(&self, device: &Device) -> Result<()> {
        device.validate()?;
        let json = serde_json::to_string(device)?;
        self.backend.put(Table::Devices, &device_key(device), &json)
    }

    pub fn find_device(
        &self,
        service: &str,
        subservice: &str,
        device_id: &str,
    ) -> Result<Option<Device>> {
        let key = record_key(service, subservice, device_id);
        match self.backend.get(Table::Devices, &key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn get_device(&self, service: &str, subservice: &str, device_id: &str) -> Result<Device> {
        self.find_device(service, subservice, device_id)?
            .ok_or_else(|| Error::NotFound(format!("device {device_id} in {service}{subservice}")))
    }

    pub fn list_devices(&self, service: &str, subservice: &str) -> Result<Vec<Device>> {
        self.scan(Table::Devices, &scope_prefix(service, subservice))
    }

    pub fn list_group_devices(&self, group: &Group) -> Result<Vec<Device>> {
        Ok(self
            .list_devices(&group.service, &group.subservice)?
            .into_iter()
            .filter(|d| d.application_id == group.application_id())
            .collect())
    }

    pub fn delete_device(&self, service: &str, subservice: &str, device_id: &str) -> Result<()> {
        let key = record_key(service, subservice, device_id);
        if !self.backend.delete(Table::Devices, &key)? {
            return Err(Error::NotFound(format!(
                "device {device_id} in {service}{subservice}"
            )));
        }
        Ok(())
    }

    /// Record the arrival time of the device's latest uplink.
    pub fn touch_device(
        &self,
        service: &str,
        subservice: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Device> {
        let key = record_key(service, subservice, device_id);
        let mut touched: Option<Device> = None;
        let updated = self
            .backend
            .update_existing(Table::Devices, &key, &mut |json| {
                let mut device: Device = serde_json::from_str(json)?;
                device.last_seen = Some(seen_at);
                let json = serde_json::to_string(&device)?;
                touched = Some(device);
                Ok(json)
            })?;

        match touched {
            Some(device) if updated => Ok(device),
            _ => Err(Error::NotFound(format!(
                "device {device_id} in {service}{subservice}"
            ))),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for (key, json) in self.backend.scan_prefix(table, prefix)? {
            match serde_json::from_str::<T>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    category = "provisioning",
                    table = table.name(),
                    key = %key.replace(KEY_SEPARATOR, "|"),
                    "Skipping unreadable record: {}",
                    e
                ),
            }
        }
        Ok(records)
    }
}
