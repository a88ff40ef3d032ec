//! Uplink pipeline for LoRaGent.
//!
//! Turns LoRaWAN uplinks received over MQTT into NGSIv2 entity updates:
//!
//! - `codec`: CayenneLPP and pre-decoded payload formats
//! - `uplink`: topic parsing and the TTN message envelope
//! - `mapper`: decoded attributes to entity updates
//! - `transport`: connection seam with MQTT and in-memory implementations
//! - `subscription`: per-broker connections and topic reconciliation
//! - `dispatcher`: the per-frame pipeline
//! - `broker`: context broker clients
//! - `agent`: lifecycle controller and provisioning entry points
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | yes | MQTT transport via rumqttc |
//! | `http` | yes | NGSIv2 context broker client via reqwest |

pub mod agent;
pub mod broker;
pub mod codec;
pub mod dispatcher;
pub mod mapper;
pub mod subscription;
pub mod transport;
pub mod uplink;

pub use agent::{LoraAgent, LoraAgentBuilder};
pub use broker::{ContextBroker, MemoryContextBroker, StoredEntity};
#[cfg(feature = "http")]
pub use broker::NgsiContextBroker;
pub use codec::Codec;
pub use dispatcher::{LiveRegistry, LoadedGroup, UplinkDispatcher};
pub use mapper::EntityMapper;
pub use subscription::{
    desired_topics, DesiredTopics, FrameHandler, ReconcileReport, SubscriptionManager,
};
pub use transport::{
    FrameSink, MemoryConnector, TransportCall, TransportConnection, TransportConnector,
};
#[cfg(feature = "mqtt")]
pub use transport::MqttConnector;
pub use uplink::{parse_uplink_topic, UplinkFrame, UplinkPayload, UplinkTopic};
