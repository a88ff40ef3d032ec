//! Subscription manager.
//!
//! Keeps one transport connection per [`ConnectionKey`] and makes the set of
//! subscribed topics on each connection equal to the desired set computed
//! from the live groups. Each connection gets a bounded frame queue and a
//! dispatcher task, so frames are handled in arrival order per connection and
//! in parallel across connections.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use loragent_core::config::{defaults, TransportConfig};
use loragent_core::model::{ConnectionKey, Group};
use loragent_core::{ConnectionState, DispatchStats, EventBus, GatewayEvent, Result};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{FrameSink, TransportConnection, TransportConnector};
use crate::uplink::UplinkFrame;

/// Topics wanted on each connection.
pub type DesiredTopics = BTreeMap<ConnectionKey, BTreeSet<String>>;

/// Compute the desired topic set from a collection of groups.
pub fn desired_topics<'a, I>(groups: I) -> DesiredTopics
where
    I: IntoIterator<Item = &'a Group>,
{
    let mut desired = DesiredTopics::new();
    for group in groups {
        desired
            .entry(group.connection_key())
            .or_default()
            .insert(group.uplink_topic());
    }
    desired
}

/// Consumer of frames taken off a connection's queue.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, key: &ConnectionKey, frame: UplinkFrame);
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub connected: usize,
    pub closed: usize,
    pub subscribed: usize,
    pub unsubscribed: usize,
    /// Transport calls that failed; retried on the next pass.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.connected == 0
            && self.closed == 0
            && self.subscribed == 0
            && self.unsubscribed == 0
            && self.failed == 0
    }
}

struct ManagedConnection {
    connection: Arc<dyn TransportConnection>,
    /// Topics confirmed subscribed. Guards all subscription changes on
    /// this connection.
    topics: Mutex<BTreeSet<String>>,
    stop: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the transport connections.
pub struct SubscriptionManager {
    connector: Arc<dyn TransportConnector>,
    handler: Arc<dyn FrameHandler>,
    config: TransportConfig,
    stats: Arc<DispatchStats>,
    event_bus: EventBus,
    connections: RwLock<HashMap<ConnectionKey, Arc<ManagedConnection>>>,
    /// Serializes whole reconciliation passes.
    reconcile_lock: Mutex<()>,
    close_timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        handler: Arc<dyn FrameHandler>,
        config: TransportConfig,
        stats: Arc<DispatchStats>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            connector,
            handler,
            config,
            stats,
            event_bus,
            connections: RwLock::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            close_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }

    /// Bound on waiting for a dispatcher when a connection is dropped
    /// during reconciliation.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Converge live connections and subscriptions on `desired`.
    ///
    /// Connections with no desired topics are closed, missing ones opened,
    /// and only the difference between current and desired topics is
    /// subscribed or unsubscribed. Transport failures are logged and counted
    /// in the report; they never abort the pass.
    pub async fn reconcile(&self, desired: &DesiredTopics) -> ReconcileReport {
        let _pass = self.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();

        let stale: Vec<ConnectionKey> = self
            .connections
            .read()
            .await
            .keys()
            .filter(|key| desired.get(*key).map_or(true, |topics| topics.is_empty()))
            .cloned()
            .collect();
        for key in stale {
            let removed = self.connections.write().await.remove(&key);
            if let Some(managed) = removed {
                shutdown_connection(&key, managed, self.close_timeout).await;
                report.closed += 1;
            }
        }

        for (key, topics) in desired {
            if topics.is_empty() {
                continue;
            }

            let existing = self.connections.read().await.get(key).cloned();
            let managed = match existing {
                Some(managed) => managed,
                None => match self.open(key).await {
                    Ok(managed) => {
                        report.connected += 1;
                        managed
                    }
                    Err(e) => {
                        warn!(
                            category = "subscription",
                            broker = %key,
                            "Failed to open connection: {}",
                            e
                        );
                        report.failed += 1;
                        continue;
                    }
                },
            };

            self.apply_topics(key, &managed, topics, &mut report).await;
        }

        if !report.is_noop() {
            info!(
                category = "subscription",
                connected = report.connected,
                closed = report.closed,
                subscribed = report.subscribed,
                unsubscribed = report.unsubscribed,
                failed = report.failed,
                "Reconciled subscriptions"
            );
        }
        report
    }

    async fn apply_topics(
        &self,
        key: &ConnectionKey,
        managed: &ManagedConnection,
        desired: &BTreeSet<String>,
        report: &mut ReconcileReport,
    ) {
        let mut current = managed.topics.lock().await;
        let to_remove: Vec<String> = current.difference(desired).cloned().collect();
        let to_add: Vec<String> = desired.difference(&current).cloned().collect();
        if to_remove.is_empty() && to_add.is_empty() {
            return;
        }

        self.publish_state(key, ConnectionState::Reconciling);

        for topic in to_remove {
            match managed.connection.unsubscribe(&topic).await {
                Ok(()) => {
                    current.remove(&topic);
                    report.unsubscribed += 1;
                }
                Err(e) => {
                    warn!(category = "subscription", broker = %key, topic = %topic, "Unsubscribe failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        for topic in to_add {
            match managed.connection.subscribe(&topic).await {
                Ok(()) => {
                    current.insert(topic);
                    report.subscribed += 1;
                }
                Err(e) => {
                    warn!(category = "subscription", broker = %key, topic = %topic, "Subscribe failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        self.publish_state(key, managed.connection.state());
    }

    async fn open(&self, key: &ConnectionKey) -> Result<Arc<ManagedConnection>> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let sink = FrameSink::new(
            tx,
            key.to_string(),
            self.stats.clone(),
            self.event_bus.clone(),
        );
        let connection = self.connector.connect(key, sink).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(
            key.clone(),
            rx,
            stop_rx,
            self.handler.clone(),
        ));

        let managed = Arc::new(ManagedConnection {
            connection,
            topics: Mutex::new(BTreeSet::new()),
            stop: stop_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        });
        self.connections
            .write()
            .await
            .insert(key.clone(), managed.clone());
        info!(category = "subscription", broker = %key, "Connection opened");
        Ok(managed)
    }

    /// Close every connection. Dispatcher tasks still busy after `timeout`
    /// are aborted.
    pub async fn close_all(&self, timeout: Duration) {
        let _pass = self.reconcile_lock.lock().await;
        let drained: Vec<(ConnectionKey, Arc<ManagedConnection>)> =
            self.connections.write().await.drain().collect();
        let count = drained.len();

        join_all(
            drained
                .into_iter()
                .map(|(key, managed)| async move { shutdown_connection(&key, managed, timeout).await }),
        )
        .await;

        if count > 0 {
            info!(category = "subscription", connections = count, "All connections closed");
        }
    }

    /// Topics currently subscribed, per connection.
    pub async fn active_subscriptions(&self) -> DesiredTopics {
        let connections: Vec<(ConnectionKey, Arc<ManagedConnection>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();

        let mut active = DesiredTopics::new();
        for (key, managed) in connections {
            let topics = managed.topics.lock().await.clone();
            if !topics.is_empty() {
                active.insert(key, topics);
            }
        }
        active
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_state(&self, key: &ConnectionKey) -> Option<ConnectionState> {
        self.connections
            .read()
            .await
            .get(key)
            .map(|m| m.connection.state())
    }

    fn publish_state(&self, key: &ConnectionKey, state: ConnectionState) {
        self.event_bus.publish(GatewayEvent::ConnectionStateChanged {
            broker: key.to_string(),
            state,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}

async fn shutdown_connection(key: &ConnectionKey, managed: Arc<ManagedConnection>, timeout: Duration) {
    if let Err(e) = managed.connection.close().await {
        warn!(category = "subscription", broker = %key, "Close failed: {}", e);
    }
    let _ = managed.stop.send(true);

    let task = managed.dispatcher.lock().await.take();
    if let Some(mut task) = task {
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(
                category = "subscription",
                broker = %key,
                timeout_ms = timeout.as_millis() as u64,
                "Dispatcher did not stop in time, aborting"
            );
            task.abort();
        }
    }
    debug!(category = "subscription", broker = %key, "Connection closed");
}

async fn dispatch_loop(
    key: ConnectionKey,
    mut frames: mpsc::Receiver<UplinkFrame>,
    mut stop: watch::Receiver<bool>,
    handler: Arc<dyn FrameHandler>,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        handler.handle(&key, frame).await;
    }

    // Settle whatever was queued before the stop so every received frame is
    // either processed or counted as dropped.
    frames.close();
    while let Some(frame) = frames.recv().await {
        handler.handle(&key, frame).await;
    }
    debug!(category = "subscription", broker = %key, "Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, TransportCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        frames: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for CountingHandler {
        async fn handle(&self, _key: &ConnectionKey, _frame: UplinkFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(connector: &MemoryConnector, handler: Arc<CountingHandler>) -> SubscriptionManager {
        SubscriptionManager::new(
            Arc::new(connector.clone()),
            handler,
            TransportConfig::default(),
            Arc::new(DispatchStats::new()),
            EventBus::new(),
        )
    }

    fn group(app: &str, host: &str) -> Group {
        Group::new("smartgondor", "/gardens", app, "LoraDeviceGroup", host)
    }

    #[test]
    fn test_desired_topics_share_connections() {
        let groups = vec![
            group("app1", "ttn"),
            group("app2", "ttn"),
            group("app3", "other"),
        ];
        let desired = desired_topics(&groups);
        assert_eq!(desired.len(), 2);
        let shared = &desired[&ConnectionKey::new("ttn", 1883)];
        assert!(shared.contains("app1/devices/+/up"));
        assert!(shared.contains("app2/devices/+/up"));
    }

    #[tokio::test]
    async fn test_reconcile_applies_difference_only() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector, Arc::new(CountingHandler::default()));

        let first = desired_topics(&[group("app1", "ttn"), group("app2", "ttn")]);
        let report = manager.reconcile(&first).await;
        assert_eq!(report.connected, 1);
        assert_eq!(report.subscribed, 2);

        connector.clear_calls().await;
        let second = desired_topics(&[group("app2", "ttn"), group("app3", "ttn")]);
        let report = manager.reconcile(&second).await;
        assert_eq!(report.subscribed, 1);
        assert_eq!(report.unsubscribed, 1);

        let key = ConnectionKey::new("ttn", 1883);
        assert_eq!(
            connector.calls().await,
            vec![
                TransportCall::Unsubscribe(key.clone(), "app1/devices/+/up".into()),
                TransportCall::Subscribe(key, "app3/devices/+/up".into()),
            ]
        );
        assert_eq!(manager.active_subscriptions().await, second);
    }

    #[tokio::test]
    async fn test_empty_desired_set_closes_connections() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector, Arc::new(CountingHandler::default()));

        manager
            .reconcile(&desired_topics(&[group("app1", "ttn")]))
            .await;
        let report = manager.reconcile(&DesiredTopics::new()).await;
        assert_eq!(report.closed, 1);
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(connector.open_connections().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_fatal() {
        let connector = MemoryConnector::new();
        connector
            .set_unreachable(&ConnectionKey::new("down", 1883), true)
            .await;
        let manager = manager(&connector, Arc::new(CountingHandler::default()));

        let desired = desired_topics(&[group("app1", "down"), group("app2", "ttn")]);
        let report = manager.reconcile(&desired).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.connected, 1);

        connector
            .set_unreachable(&ConnectionKey::new("down", 1883), false)
            .await;
        let report = manager.reconcile(&desired).await;
        assert_eq!(report.connected, 1);
        assert_eq!(manager.active_subscriptions().await, desired);
    }

    #[tokio::test]
    async fn test_frames_reach_handler_and_close_all_stops() {
        let connector = MemoryConnector::new();
        let handler = Arc::new(CountingHandler::default());
        let manager = manager(&connector, handler.clone());
        let key = ConnectionKey::new("ttn", 1883);

        manager
            .reconcile(&desired_topics(&[group("app1", "ttn")]))
            .await;
        assert!(connector.publish(&key, "app1/devices/devA/up", vec![1]).await);

        for _ in 0..50 {
            if handler.frames.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.frames.load(Ordering::SeqCst), 1);

        manager.close_all(Duration::from_secs(1)).await;
        assert_eq!(manager.connection_count().await, 0);
        assert!(!connector.publish(&key, "app1/devices/devA/up", vec![1]).await);
    }
}
