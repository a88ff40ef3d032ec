//! Storage layer for LoRaGent.
//!
//! Provides the provisioning store (groups and devices) on top of a small
//! key-value collaborator with two backends:
//! - `RedbStore`: persistent, single-file redb database
//! - `MemoryStore`: in-process, used by tests and ephemeral runs

pub mod backend;
pub mod error;
pub mod provisioning;
pub mod redb_store;

pub use backend::{KeyValueStore, MemoryStore, Table, WriteOp};
pub use error::{Error, Result};
pub use provisioning::ProvisioningStore;
pub use redb_store::RedbStore;
