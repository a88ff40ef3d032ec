//! Publish/subscribe transport seam.
//!
//! A [`TransportConnector`] opens one [`TransportConnection`] per
//! [`ConnectionKey`]. Connections hand every inbound message to a
//! [`FrameSink`], which only enqueues; frames are processed by the
//! connection's dispatcher task.

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;
use loragent_core::model::ConnectionKey;
use loragent_core::{ConnectionState, DispatchStats, DropReason, EventBus, GatewayEvent, Result};
use tokio::sync::mpsc;
use tracing::warn;

use crate::uplink::UplinkFrame;

pub use memory::{MemoryConnector, TransportCall};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttConnector;

/// A live connection to one broker.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    fn key(&self) -> &ConnectionKey;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    fn state(&self) -> ConnectionState;

    /// Disconnect and stop delivering frames.
    async fn close(&self) -> Result<()>;
}

/// Opens connections. Implementations own reconnect behaviour.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        key: &ConnectionKey,
        sink: FrameSink,
    ) -> Result<Arc<dyn TransportConnection>>;
}

/// Entry point of a connection's bounded frame queue.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<UplinkFrame>,
    broker: String,
    stats: Arc<DispatchStats>,
    event_bus: EventBus,
}

impl FrameSink {
    pub fn new(
        tx: mpsc::Sender<UplinkFrame>,
        broker: impl Into<String>,
        stats: Arc<DispatchStats>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            tx,
            broker: broker.into(),
            stats,
            event_bus,
        }
    }

    /// Enqueue without waiting. Returns `false` if the frame was dropped.
    pub fn offer(&self, frame: UplinkFrame) -> bool {
        self.stats.record_received();
        let (reason, detail, topic) = match self.tx.try_send(frame) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(frame)) => (
                DropReason::QueueFull,
                format!("frame queue for {} is full", self.broker),
                frame.topic,
            ),
            Err(mpsc::error::TrySendError::Closed(frame)) => (
                DropReason::Internal,
                format!("dispatcher for {} has stopped", self.broker),
                frame.topic,
            ),
        };

        warn!(
            category = "transport",
            broker = %self.broker,
            topic = %topic,
            reason = %reason,
            "Dropping uplink: {}",
            detail
        );
        self.stats.record_dropped(reason);
        self.event_bus.publish(GatewayEvent::FrameDropped {
            topic,
            reason,
            detail,
            timestamp: chrono::Utc::now().timestamp(),
        });
        false
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
