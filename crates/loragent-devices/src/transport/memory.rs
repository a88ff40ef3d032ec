//! In-process transport.
//!
//! Records every connect/subscribe/unsubscribe/close call and lets callers
//! publish frames to whichever connection has a matching subscription.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use loragent_core::model::ConnectionKey;
use loragent_core::{ConnectionState, Error, Result};
use tokio::sync::RwLock;

use super::{topic_matches, FrameSink, TransportConnection, TransportConnector};
use crate::uplink::UplinkFrame;

/// A call made against the memory transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(ConnectionKey),
    Subscribe(ConnectionKey, String),
    Unsubscribe(ConnectionKey, String),
    Close(ConnectionKey),
}

impl TransportCall {
    pub fn is_subscription_change(&self) -> bool {
        matches!(
            self,
            TransportCall::Subscribe(..) | TransportCall::Unsubscribe(..)
        )
    }
}

type CallLog = Arc<RwLock<Vec<TransportCall>>>;

/// Connector handing out [`MemoryConnection`]s.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    calls: CallLog,
    connections: Arc<RwLock<HashMap<ConnectionKey, Arc<MemoryConnection>>>>,
    unreachable: Arc<RwLock<HashSet<ConnectionKey>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connects to `key` fail until cleared.
    pub async fn set_unreachable(&self, key: &ConnectionKey, unreachable: bool) {
        let mut keys = self.unreachable.write().await;
        if unreachable {
            keys.insert(key.clone());
        } else {
            keys.remove(key);
        }
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Number of connections not yet closed.
    pub async fn open_connections(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Topics currently subscribed on each open connection.
    pub async fn active_subscriptions(&self) -> BTreeMap<ConnectionKey, BTreeSet<String>> {
        let connections = self.connections.read().await;
        let mut active = BTreeMap::new();
        for (key, connection) in connections.iter() {
            if connection.is_closed() {
                continue;
            }
            let topics = connection.topics.read().await.clone();
            if !topics.is_empty() {
                active.insert(key.clone(), topics);
            }
        }
        active
    }

    /// Deliver a message as the broker at `key` would.
    ///
    /// Returns `true` if a subscription matched and the frame was queued.
    pub async fn publish(
        &self,
        key: &ConnectionKey,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> bool {
        let connection = match self.connections.read().await.get(key) {
            Some(c) if !c.is_closed() => c.clone(),
            _ => return false,
        };
        if !connection.matches(topic).await {
            return false;
        }
        let delivered = match connection.sink.read().await.as_ref() {
            Some(sink) => sink.offer(UplinkFrame::new(topic, payload)),
            None => false,
        };
        delivered
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        sink: FrameSink,
    ) -> Result<Arc<dyn TransportConnection>> {
        self.calls
            .write()
            .await
            .push(TransportCall::Connect(key.clone()));

        if self.unreachable.read().await.contains(key) {
            return Err(Error::Transport(format!("{} is unreachable", key)));
        }

        let connection = Arc::new(MemoryConnection {
            key: key.clone(),
            sink: RwLock::new(Some(sink)),
            topics: RwLock::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            calls: self.calls.clone(),
        });
        self.connections
            .write()
            .await
            .insert(key.clone(), connection.clone());
        Ok(connection)
    }
}

/// Connection created by [`MemoryConnector`].
pub struct MemoryConnection {
    key: ConnectionKey,
    sink: RwLock<Option<FrameSink>>,
    topics: RwLock<BTreeSet<String>>,
    closed: AtomicBool,
    calls: CallLog,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn matches(&self, topic: &str) -> bool {
        self.topics
            .read()
            .await
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport(format!("connection {} is closed", self.key)));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        self.calls
            .write()
            .await
            .push(TransportCall::Subscribe(self.key.clone(), topic.to_string()));
        self.topics.write().await.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        self.calls
            .write()
            .await
            .push(TransportCall::Unsubscribe(self.key.clone(), topic.to_string()));
        self.topics.write().await.remove(topic);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.calls
            .write()
            .await
            .push(TransportCall::Close(self.key.clone()));
        self.topics.write().await.clear();
        // Dropping the sink lets the dispatcher queue drain and close.
        self.sink.write().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loragent_core::{DispatchStats, EventBus};
    use tokio::sync::mpsc;

    fn sink(tx: mpsc::Sender<UplinkFrame>) -> FrameSink {
        FrameSink::new(tx, "test", Arc::new(DispatchStats::new()), EventBus::new())
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscription() {
        let connector = MemoryConnector::new();
        let key = ConnectionKey::new("localhost", 1883);
        let (tx, mut rx) = mpsc::channel(8);

        let connection = connector.connect(&key, sink(tx)).await.unwrap();
        connection.subscribe("app1/devices/+/up").await.unwrap();

        assert!(connector.publish(&key, "app1/devices/devA/up", b"x".to_vec()).await);
        assert!(!connector.publish(&key, "app2/devices/devA/up", b"x".to_vec()).await);
        assert_eq!(rx.recv().await.unwrap().topic, "app1/devices/devA/up");
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let connector = MemoryConnector::new();
        let key = ConnectionKey::new("localhost", 1883);
        let (tx, mut rx) = mpsc::channel(8);

        let connection = connector.connect(&key, sink(tx)).await.unwrap();
        connection.subscribe("app1/devices/+/up").await.unwrap();
        connection.close().await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connector.open_connections().await, 0);
        assert!(!connector.publish(&key, "app1/devices/devA/up", vec![1]).await);
        assert!(rx.recv().await.is_none());
        assert!(connection.subscribe("app1/devices/+/up").await.is_err());

        let calls = connector.calls().await;
        assert_eq!(calls.last(), Some(&TransportCall::Close(key)));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let connector = MemoryConnector::new();
        let key = ConnectionKey::new("down", 1883);
        connector.set_unreachable(&key, true).await;
        let (tx, _rx) = mpsc::channel(1);
        assert!(connector.connect(&key, sink(tx)).await.is_err());
    }
}
