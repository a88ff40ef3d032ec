//! Lifecycle controller.
//!
//! [`LoraAgent`] wires the provisioning store, the subscription manager and
//! the dispatcher together. `start()` loads every persisted group and drives
//! the subscriptions to the converged set; `stop()` tears connections down.
//! Provisioning calls go through the agent so that a running agent
//! reconciles right after each group change.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loragent_core::config::{GatewayConfig, StorageBackendKind};
use loragent_core::model::{ConnectionKey, Device, Group};
use loragent_core::{DispatchStats, EventBus, GatewayEvent, Result, StatsSnapshot};
use loragent_storage::ProvisioningStore;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::ContextBroker;
use crate::dispatcher::{LiveRegistry, UplinkDispatcher};
use crate::subscription::{desired_topics, DesiredTopics, ReconcileReport, SubscriptionManager};
use crate::transport::TransportConnector;

/// Builder for [`LoraAgent`]. Collaborators not supplied are created from
/// the configuration.
pub struct LoraAgentBuilder {
    config: GatewayConfig,
    store: Option<ProvisioningStore>,
    connector: Option<Arc<dyn TransportConnector>>,
    broker: Option<Arc<dyn ContextBroker>>,
    event_bus: Option<EventBus>,
}

impl LoraAgentBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            connector: None,
            broker: None,
            event_bus: None,
        }
    }

    pub fn store(mut self, store: ProvisioningStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn ContextBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Result<LoraAgent> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => match config.storage.backend {
                StorageBackendKind::Redb => ProvisioningStore::open(&config.storage.path)?,
                StorageBackendKind::Memory => ProvisioningStore::in_memory(),
            },
        };
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&config)?,
        };
        let broker = match self.broker {
            Some(broker) => broker,
            None => default_broker(&config)?,
        };
        let event_bus = self.event_bus.unwrap_or_default();

        let stats = Arc::new(DispatchStats::new());
        let registry = Arc::new(LiveRegistry::new());
        let dispatcher = Arc::new(UplinkDispatcher::new(
            store.clone(),
            registry.clone(),
            broker,
            stats.clone(),
            event_bus.clone(),
        ));
        let subscriptions = SubscriptionManager::new(
            connector,
            dispatcher.clone(),
            config.transport.clone(),
            stats.clone(),
            event_bus.clone(),
        )
        .with_close_timeout(config.agent.shutdown_timeout());

        Ok(LoraAgent {
            config,
            store,
            event_bus,
            stats,
            registry,
            dispatcher,
            subscriptions,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }
}

#[cfg(feature = "mqtt")]
fn default_connector(config: &GatewayConfig) -> Result<Arc<dyn TransportConnector>> {
    Ok(Arc::new(crate::transport::MqttConnector::new(
        config.transport.clone(),
    )))
}

#[cfg(not(feature = "mqtt"))]
fn default_connector(_config: &GatewayConfig) -> Result<Arc<dyn TransportConnector>> {
    Err(loragent_core::config_err!(
        "no transport connector supplied and the mqtt feature is disabled"
    ))
}

#[cfg(feature = "http")]
fn default_broker(config: &GatewayConfig) -> Result<Arc<dyn ContextBroker>> {
    Ok(Arc::new(crate::broker::NgsiContextBroker::new(
        &config.context_broker,
    )?))
}

#[cfg(not(feature = "http"))]
fn default_broker(_config: &GatewayConfig) -> Result<Arc<dyn ContextBroker>> {
    Err(loragent_core::config_err!(
        "no context broker supplied and the http feature is disabled"
    ))
}

/// The gateway.
pub struct LoraAgent {
    config: GatewayConfig,
    store: ProvisioningStore,
    event_bus: EventBus,
    stats: Arc<DispatchStats>,
    registry: Arc<LiveRegistry>,
    dispatcher: Arc<UplinkDispatcher>,
    subscriptions: SubscriptionManager,
    running: AtomicBool,
    /// Serializes start, stop and provisioning-triggered reconciliation.
    lifecycle: Mutex<()>,
}

impl LoraAgent {
    pub fn builder(config: GatewayConfig) -> LoraAgentBuilder {
        LoraAgentBuilder::new(config)
    }

    // ========== Lifecycle ==========

    /// Load all groups, converge subscriptions and start dispatching.
    ///
    /// A store failure here aborts startup. Starting a running agent is a
    /// no-op.
    pub async fn start(&self) -> Result<ReconcileReport> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(ReconcileReport::default());
        }

        let groups = self.store.list_all_groups()?;
        self.dispatcher.set_accepting(true);
        let report = self.converge(&groups).await;
        self.running.store(true, Ordering::SeqCst);

        info!(
            category = "agent",
            groups = groups.len(),
            connections = self.subscriptions.connection_count().await,
            "LoRaWAN agent started"
        );
        Ok(report)
    }

    /// Stop accepting frames and close every connection.
    ///
    /// Dispatcher tasks get `agent.shutdown_timeout_ms` to finish the frame
    /// in flight before they are aborted.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return;
        }

        self.dispatcher.set_accepting(false);
        self.subscriptions
            .close_all(self.config.agent.shutdown_timeout())
            .await;
        self.registry.clear().await;
        self.running.store(false, Ordering::SeqCst);
        info!(category = "agent", "LoRaWAN agent stopped");
    }

    /// Recompute the desired subscriptions from the store and converge.
    ///
    /// Does nothing while the agent is stopped.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(ReconcileReport::default());
        }
        let groups = self.store.list_all_groups()?;
        Ok(self.converge(&groups).await)
    }

    /// Reconcile every `period` until `shutdown` resolves.
    ///
    /// Retries transport calls that failed on earlier passes and picks up
    /// groups written to the store outside this agent. Ticks while the agent
    /// is stopped do nothing. A pass in progress is finished before returning.
    pub async fn reconcile_until<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = interval.tick() => {}
            }
            match self.reconcile().await {
                Ok(report) if report.failed > 0 => warn!(
                    category = "agent",
                    failed = report.failed,
                    "Periodic reconciliation left transport calls pending"
                ),
                Ok(report) if !report.is_noop() => debug!(
                    category = "agent",
                    subscribed = report.subscribed,
                    unsubscribed = report.unsubscribed,
                    "Periodic reconciliation applied changes"
                ),
                Ok(_) => {}
                Err(e) => warn!(category = "agent", "Periodic reconciliation failed: {}", e),
            }
        }
    }

    async fn converge(&self, groups: &[Group]) -> ReconcileReport {
        self.registry.replace_all(groups).await;
        self.subscriptions.reconcile(&desired_topics(groups)).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========== Provisioning ==========

    pub async fn create_group(&self, group: Group) -> Result<()> {
        self.store.create_group(&group)?;
        info!(
            category = "agent",
            application_id = group.application_id(),
            service = %group.scope(),
            "Group provisioned"
        );
        self.publish_group_event(&group, false);
        self.reconcile_after_change().await;
        Ok(())
    }

    /// Replace an existing group. Its devices are kept.
    pub async fn replace_group(&self, group: Group) -> Result<()> {
        self.store.replace_group(&group)?;
        info!(
            category = "agent",
            application_id = group.application_id(),
            service = %group.scope(),
            "Group replaced"
        );
        self.publish_group_event(&group, false);
        self.reconcile_after_change().await;
        Ok(())
    }

    /// Delete a group and its devices.
    pub async fn delete_group(
        &self,
        service: &str,
        subservice: &str,
        application_id: &str,
    ) -> Result<Group> {
        let group = self.store.delete_group(service, subservice, application_id)?;
        info!(
            category = "agent",
            application_id,
            service = %group.scope(),
            "Group removed"
        );
        self.publish_group_event(&group, true);
        self.reconcile_after_change().await;
        Ok(group)
    }

    pub fn get_group(&self, service: &str, subservice: &str, application_id: &str) -> Result<Group> {
        Ok(self.store.get_group(service, subservice, application_id)?)
    }

    pub fn list_groups(&self, service: &str, subservice: &str) -> Result<Vec<Group>> {
        Ok(self.store.list_groups(service, subservice)?)
    }

    /// Register a device explicitly. Its group must exist.
    ///
    /// Device records do not affect subscriptions, so no reconciliation runs.
    pub fn create_device(&self, device: Device) -> Result<()> {
        self.store.create_device(&device)?;
        self.event_bus.publish(GatewayEvent::DeviceProvisioned {
            service: device.service.clone(),
            subservice: device.subservice.clone(),
            device_id: device.device_id.clone(),
            autoprovisioned: device.autoprovisioned,
            timestamp: Utc::now().timestamp(),
        });
        Ok(())
    }

    pub fn get_device(&self, service: &str, subservice: &str, device_id: &str) -> Result<Device> {
        Ok(self.store.get_device(service, subservice, device_id)?)
    }

    pub fn list_devices(&self, service: &str, subservice: &str) -> Result<Vec<Device>> {
        Ok(self.store.list_devices(service, subservice)?)
    }

    pub fn delete_device(&self, service: &str, subservice: &str, device_id: &str) -> Result<()> {
        Ok(self.store.delete_device(service, subservice, device_id)?)
    }

    async fn reconcile_after_change(&self) {
        if let Err(e) = self.reconcile().await {
            warn!(
                category = "agent",
                "Reconciliation after provisioning change failed: {}",
                e
            );
        }
    }

    fn publish_group_event(&self, group: &Group, removed: bool) {
        let service = group.service.clone();
        let subservice = group.subservice.clone();
        let application_id = group.application_id().to_string();
        let timestamp = Utc::now().timestamp();
        self.event_bus.publish(if removed {
            GatewayEvent::GroupRemoved {
                service,
                subservice,
                application_id,
                timestamp,
            }
        } else {
            GatewayEvent::GroupProvisioned {
                service,
                subservice,
                application_id,
                timestamp,
            }
        });
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &ProvisioningStore {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn active_subscriptions(&self) -> DesiredTopics {
        self.subscriptions.active_subscriptions().await
    }

    pub async fn connection_count(&self) -> usize {
        self.subscriptions.connection_count().await
    }

    pub async fn connection_state(
        &self,
        key: &ConnectionKey,
    ) -> Option<loragent_core::ConnectionState> {
        self.subscriptions.connection_state(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryContextBroker;
    use crate::transport::MemoryConnector;

    fn agent(connector: &MemoryConnector) -> LoraAgent {
        LoraAgent::builder(GatewayConfig::default())
            .store(ProvisioningStore::in_memory())
            .connector(Arc::new(connector.clone()))
            .broker(Arc::new(MemoryContextBroker::new()))
            .build()
            .unwrap()
    }

    fn group(app: &str) -> Group {
        Group::new("smartgondor", "/gardens", app, "LoraDeviceGroup", "localhost")
    }

    #[tokio::test]
    async fn test_provisioning_while_stopped_does_not_connect() {
        let connector = MemoryConnector::new();
        let agent = agent(&connector);
        agent.create_group(group("app1")).await.unwrap();
        assert!(connector.calls().await.is_empty());

        agent.start().await.unwrap();
        assert_eq!(agent.connection_count().await, 1);
        agent.stop().await;
        assert_eq!(connector.open_connections().await, 0);
    }

    #[tokio::test]
    async fn test_group_changes_reconcile_when_running() {
        let connector = MemoryConnector::new();
        let agent = agent(&connector);
        agent.start().await.unwrap();
        assert_eq!(agent.connection_count().await, 0);

        agent.create_group(group("app1")).await.unwrap();
        agent.create_group(group("app2")).await.unwrap();
        let key = ConnectionKey::new("localhost", 1883);
        assert_eq!(agent.active_subscriptions().await[&key].len(), 2);

        agent
            .delete_group("smartgondor", "/gardens", "app1")
            .await
            .unwrap();
        let active = agent.active_subscriptions().await;
        assert_eq!(
            active[&key].iter().collect::<Vec<_>>(),
            vec!["app2/devices/+/up"]
        );

        agent
            .delete_group("smartgondor", "/gardens", "app2")
            .await
            .unwrap();
        assert_eq!(agent.connection_count().await, 0);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let connector = MemoryConnector::new();
        let agent = agent(&connector);
        agent.create_group(group("app1")).await.unwrap();
        agent.start().await.unwrap();
        let report = agent.start().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(connector.open_connections().await, 1);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_pass_recovers_unreachable_broker() {
        let connector = MemoryConnector::new();
        let key = ConnectionKey::new("localhost", 1883);
        connector.set_unreachable(&key, true).await;
        let agent = agent(&connector);
        agent.create_group(group("app1")).await.unwrap();

        let report = agent.start().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(agent.connection_count().await, 0);

        connector.set_unreachable(&key, false).await;
        agent
            .reconcile_until(
                Duration::from_millis(50),
                tokio::time::sleep(Duration::from_millis(300)),
            )
            .await;
        assert_eq!(agent.active_subscriptions().await[&key].len(), 1);

        // Written straight to the store, bypassing the agent.
        agent.store().create_group(&group("app2")).unwrap();
        agent
            .reconcile_until(
                Duration::from_millis(50),
                tokio::time::sleep(Duration::from_millis(300)),
            )
            .await;
        assert_eq!(agent.active_subscriptions().await[&key].len(), 2);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_group_is_conflict() {
        let connector = MemoryConnector::new();
        let agent = agent(&connector);
        agent.create_group(group("app1")).await.unwrap();
        let err = agent.create_group(group("app1")).await.unwrap_err();
        assert!(matches!(err, loragent_core::Error::Conflict(_)));
    }
}
