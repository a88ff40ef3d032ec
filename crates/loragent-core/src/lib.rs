//! Core types for LoRaGent, the LoRaWAN to context-broker gateway.
//!
//! This crate defines the foundational abstractions shared by the storage and
//! device crates: the unified error type, provisioning records, entity
//! updates, configuration and the observability event bus.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod model;
pub mod stats;

pub use config::{GatewayConfig, ReconnectPolicy, StorageBackendKind};
pub use error::{Error, Result};
pub use event::{ConnectionState, DropReason, GatewayEvent};
pub use eventbus::{EventBus, EventBusReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use model::{
    AttributeMapping, AttributeValue, ConnectionKey, DecodedAttribute, Device, EntityUpdate,
    Group, ServiceScope, StaticAttribute,
};
pub use stats::{DispatchStats, StatsSnapshot};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::event::{DropReason, GatewayEvent};
    pub use crate::eventbus::EventBus;
    pub use crate::model::{ConnectionKey, DecodedAttribute, Device, EntityUpdate, Group};
}
