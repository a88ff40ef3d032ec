//! On-disk key-value backend using redb.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use crate::backend::{KeyValueStore, Table, WriteOp};
use crate::{Error, Result};

// Groups table: key = service\x1fsubservice\x1fapplication_id, value = Group (JSON)
const GROUPS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("lora_groups");

// Devices table: key = service\x1fsubservice\x1fdevice_id, value = Device (JSON)
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("lora_devices");

fn definition(table: Table) -> TableDefinition<'static, &'static str, &'static str> {
    match table {
        Table::Groups => GROUPS_TABLE,
        Table::Devices => DEVICES_TABLE,
    }
}

/// Provisioning database backed by a single redb file.
pub struct RedbStore {
    db: Database,
    path: String,
}

impl RedbStore {
    /// Open or create a store at the given path, creating missing tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path_ref).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => Error::Storage(format!(
                "provisioning database {} is in use by another process",
                path_ref.display()
            )),
            other => other.into(),
        })?;
        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let _ = write_txn.open_table(definition(table))?;
            }
        }
        write_txn.commit()?;

        let path = path_ref.to_string_lossy().to_string();
        info!(category = "storage", path = %path, "Opened provisioning database");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl KeyValueStore for RedbStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(definition(table))?;
        let value = t.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    fn put(&self, table: Table, key: &str, value: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(definition(table))?;
            t.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn insert_new(&self, table: Table, key: &str, value: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut t = write_txn.open_table(definition(table))?;
            let exists = t.get(key)?.is_some();
            if !exists {
                t.insert(key, value)?;
            }
            !exists
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    fn update_existing(
        &self,
        table: Table,
        key: &str,
        update: &mut dyn FnMut(&str) -> Result<String>,
    ) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut t = write_txn.open_table(definition(table))?;
            let current = t.get(key)?.map(|v| v.value().to_string());
            match current {
                Some(current) => {
                    let next = update(&current)?;
                    t.insert(key, next.as_str())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    fn delete(&self, table: Table, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut t = write_txn.open_table(definition(table))?;
            let removed = t.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, String)>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(definition(table))?;

        let mut entries = Vec::new();
        for result in t.range::<&str>(prefix..)? {
            let (key, value) = result?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_string(), value.value().to_string()));
        }
        Ok(entries)
    }

    fn batch(&self, ops: &[WriteOp]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut groups = write_txn.open_table(GROUPS_TABLE)?;
            let mut devices = write_txn.open_table(DEVICES_TABLE)?;
            for op in ops {
                match op {
                    WriteOp::Put { table, key, value } => {
                        let t = match table {
                            Table::Groups => &mut groups,
                            Table::Devices => &mut devices,
                        };
                        t.insert(key.as_str(), value.as_str())?;
                    }
                    WriteOp::Delete { table, key } => {
                        let t = match table {
                            Table::Groups => &mut groups,
                            Table::Devices => &mut devices,
                        };
                        t.remove(key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_temp_store() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("provisioning.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_redb_crud() {
        let (_dir, store) = create_temp_store();

        store.put(Table::Groups, "k1", "{}").unwrap();
        assert_eq!(store.get(Table::Groups, "k1").unwrap().as_deref(), Some("{}"));
        assert!(!store.insert_new(Table::Groups, "k1", "[]").unwrap());
        assert!(store.insert_new(Table::Groups, "k2", "[]").unwrap());
        assert!(store.delete(Table::Groups, "k1").unwrap());
        assert_eq!(store.get(Table::Groups, "k1").unwrap(), None);
    }

    #[test]
    fn test_redb_update_existing_skips_missing_keys() {
        let (_dir, store) = create_temp_store();
        let mut upper = |v: &str| -> Result<String> { Ok(v.to_uppercase()) };

        assert!(!store.update_existing(Table::Devices, "gone", &mut upper).unwrap());
        assert_eq!(store.get(Table::Devices, "gone").unwrap(), None);

        store.put(Table::Devices, "d1", "abc").unwrap();
        assert!(store.update_existing(Table::Devices, "d1", &mut upper).unwrap());
        assert_eq!(store.get(Table::Devices, "d1").unwrap().as_deref(), Some("ABC"));
    }

    #[test]
    fn test_redb_scan_prefix_stops_at_boundary() {
        let (_dir, store) = create_temp_store();
        store.put(Table::Devices, "a\u{1f}1", "x").unwrap();
        store.put(Table::Devices, "a\u{1f}2", "y").unwrap();
        store.put(Table::Devices, "b\u{1f}1", "z").unwrap();

        let entries = store.scan_prefix(Table::Devices, "a\u{1f}").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.scan_prefix(Table::Devices, "").unwrap().len(), 3);
    }

    #[test]
    fn test_redb_second_open_reports_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioning.redb");
        let _first = RedbStore::open(&path).unwrap();

        match RedbStore::open(&path) {
            Err(Error::Storage(msg)) => assert!(msg.contains("in use by another process")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second open must fail while the first is live"),
        }
    }

    #[test]
    fn test_redb_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/provisioning.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .batch(&[WriteOp::Put {
                    table: Table::Groups,
                    key: "g".into(),
                    value: "v".into(),
                }])
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get(Table::Groups, "g").unwrap().as_deref(), Some("v"));
    }
}
