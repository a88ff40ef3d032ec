//! Key-value persistence collaborator.
//!
//! The provisioning store only needs string keys and string (JSON) values in
//! a couple of named tables, plus an atomic batch for cascading deletes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::Result;

/// Named tables of the provisioning database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Groups,
    Devices,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Groups, Table::Devices];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Groups => "lora_groups",
            Table::Devices => "lora_devices",
        }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: String,
    },
    Delete {
        table: Table,
        key: String,
    },
}

/// Minimal get/put/delete interface over a persistence engine.
///
/// Every method is one transaction: readers never observe a partial write.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, table: Table, key: &str) -> Result<Option<String>>;

    fn put(&self, table: Table, key: &str, value: &str) -> Result<()>;

    /// Insert only if `key` is absent. Returns `false` when it already existed.
    fn insert_new(&self, table: Table, key: &str, value: &str) -> Result<bool>;

    /// Rewrite the value at `key` in one transaction. Absent keys are left
    /// absent and `false` is returned. An error from `update` aborts the write.
    fn update_existing(
        &self,
        table: Table,
        key: &str,
        update: &mut dyn FnMut(&str) -> Result<String>,
    ) -> Result<bool>;

    /// Returns `true` if the key existed.
    fn delete(&self, table: Table, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Apply all operations atomically.
    fn batch(&self, ops: &[WriteOp]) -> Result<()>;
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|t| t.get(key).cloned()))
    }

    fn put(&self, table: Table, key: &str, value: &str) -> Result<()> {
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn insert_new(&self, table: Table, key: &str, value: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let t = tables.entry(table).or_default();
        if t.contains_key(key) {
            return Ok(false);
        }
        t.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn update_existing(
        &self,
        table: Table,
        key: &str,
        update: &mut dyn FnMut(&str) -> Result<String>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(value) = tables.get_mut(&table).and_then(|t| t.get_mut(key)) else {
            return Ok(false);
        };
        *value = update(value.as_str())?;
        Ok(true)
    }

    fn delete(&self, table: Table, key: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .get_mut(&table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, String)>> {
        let tables = self.tables.read();
        let Some(t) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch(&self, ops: &[WriteOp]) -> Result<()> {
        let mut tables = self.tables.write();
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables
                        .entry(*table)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(table) {
                        t.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}
