//! Uplink dispatcher.
//!
//! Resolves the group and device of each frame, decodes it, maps it to an
//! entity update and forwards the update to the context broker. A failure at
//! any step drops the frame; every drop is logged, counted and published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loragent_core::model::{ConnectionKey, Device, EntityUpdate, Group};
use loragent_core::{DispatchStats, DropReason, Error, EventBus, GatewayEvent, Result};
use loragent_storage::{Error as StorageError, ProvisioningStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::ContextBroker;
use crate::codec::Codec;
use crate::mapper::EntityMapper;
use crate::subscription::FrameHandler;
use crate::uplink::{parse_uplink_topic, UplinkFrame, UplinkPayload, UplinkTopic};

/// A group as held in the live registry, with its codec resolved.
#[derive(Debug, Clone)]
pub struct LoadedGroup {
    pub group: Group,
    /// `None` if the group names a codec this build does not know.
    pub codec: Option<Codec>,
}

impl LoadedGroup {
    pub fn new(group: Group) -> Self {
        let codec = match Codec::from_id(group.codec_id()) {
            Ok(codec) => Some(codec),
            Err(e) => {
                warn!(
                    category = "dispatcher",
                    application_id = group.application_id(),
                    "Group loaded without a codec: {}",
                    e
                );
                None
            }
        };
        Self { group, codec }
    }

    fn codec(&self) -> Result<Codec> {
        self.codec
            .ok_or_else(|| Error::UnsupportedCodec(self.group.codec_id().to_string()))
    }
}

type RegistryKey = (ConnectionKey, String);

/// Groups currently served, indexed by connection and application id.
#[derive(Default)]
pub struct LiveRegistry {
    groups: RwLock<HashMap<RegistryKey, Vec<Arc<LoadedGroup>>>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole registry with `groups`.
    pub async fn replace_all(&self, groups: &[Group]) {
        let mut index: HashMap<RegistryKey, Vec<Arc<LoadedGroup>>> = HashMap::new();
        for group in groups {
            let key = (group.connection_key(), group.application_id().to_string());
            index
                .entry(key)
                .or_default()
                .push(Arc::new(LoadedGroup::new(group.clone())));
        }
        *self.groups.write().await = index;
    }

    /// Groups receiving uplinks of `application_id` on `connection`.
    pub async fn lookup(
        &self,
        connection: &ConnectionKey,
        application_id: &str,
    ) -> Vec<Arc<LoadedGroup>> {
        self.groups
            .read()
            .await
            .get(&(connection.clone(), application_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.groups.write().await.clear();
    }
}

/// Frame handler driving the uplink pipeline.
pub struct UplinkDispatcher {
    store: ProvisioningStore,
    registry: Arc<LiveRegistry>,
    broker: Arc<dyn ContextBroker>,
    stats: Arc<DispatchStats>,
    event_bus: EventBus,
    accepting: AtomicBool,
}

impl UplinkDispatcher {
    pub fn new(
        store: ProvisioningStore,
        registry: Arc<LiveRegistry>,
        broker: Arc<dyn ContextBroker>,
        stats: Arc<DispatchStats>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            stats,
            event_bus,
            accepting: AtomicBool::new(false),
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run one frame through the pipeline.
    ///
    /// Returns one result per live group the frame was routed to; errors
    /// raised before routing yield a single `Err`. Nothing is recorded.
    pub async fn process(
        &self,
        connection: &ConnectionKey,
        frame: &UplinkFrame,
    ) -> Vec<Result<EntityUpdate>> {
        let routed = match self.route(connection, frame).await {
            Ok(routed) => routed,
            Err(e) => return vec![Err(e)],
        };

        let (topic, groups, payload) = routed;
        let mut results = Vec::with_capacity(groups.len());
        for loaded in groups {
            results.push(self.process_for_group(&loaded, &topic, &payload, frame).await);
        }
        results
    }

    async fn route(
        &self,
        connection: &ConnectionKey,
        frame: &UplinkFrame,
    ) -> Result<(UplinkTopic, Vec<Arc<LoadedGroup>>, UplinkPayload)> {
        if !self.is_accepting() {
            return Err(Error::Internal("gateway is not accepting frames".to_string()));
        }

        let topic = parse_uplink_topic(&frame.topic)?;
        let groups = self.registry.lookup(connection, &topic.application_id).await;
        if groups.is_empty() {
            return Err(Error::UnknownApplication(format!(
                "no live group for application {} on {}",
                topic.application_id, connection
            )));
        }

        let payload = UplinkPayload::parse(&frame.payload)?;
        Ok((topic, groups, payload))
    }

    async fn process_for_group(
        &self,
        loaded: &LoadedGroup,
        topic: &UplinkTopic,
        payload: &UplinkPayload,
        frame: &UplinkFrame,
    ) -> Result<EntityUpdate> {
        let group = &loaded.group;
        let codec = loaded.codec()?;
        let device = self.resolve_device(group, &topic.device_id, payload)?;

        let decoded = codec.decode(&payload.raw, payload.fields.as_ref())?;
        let update = EntityMapper::map(group, &device, decoded, frame.received_at);
        self.broker.upsert(&update).await?;

        if let Err(e) = self.store.touch_device(
            &device.service,
            &device.subservice,
            &device.device_id,
            frame.received_at,
        ) {
            warn!(
                category = "dispatcher",
                device_id = %device.device_id,
                "Failed to record last_seen: {}",
                e
            );
        }
        Ok(update)
    }

    /// Find the device record, creating it if the group allows.
    fn resolve_device(
        &self,
        group: &Group,
        device_id: &str,
        payload: &UplinkPayload,
    ) -> Result<Device> {
        let existing = self
            .store
            .find_device(&group.service, &group.subservice, device_id)?;

        match existing {
            Some(device) if device.application_id == group.application_id() => Ok(device),
            Some(device) => Err(Error::UnknownDevice(format!(
                "device {} in {} belongs to application {}, not {}",
                device_id,
                group.scope(),
                device.application_id,
                group.application_id()
            ))),
            None if !group.autoprovision => Err(Error::UnknownDevice(format!(
                "device {} is not provisioned in {} and autoprovisioning is disabled",
                device_id,
                group.scope()
            ))),
            None => self.autoprovision(group, device_id, payload),
        }
    }

    fn autoprovision(
        &self,
        group: &Group,
        device_id: &str,
        payload: &UplinkPayload,
    ) -> Result<Device> {
        let mut device = Device::autoprovisioned(group, device_id);
        device.dev_eui = payload.dev_eui.clone();

        match self.store.create_device(&device) {
            Ok(()) => {
                info!(
                    category = "dispatcher",
                    device_id,
                    application_id = group.application_id(),
                    service = %group.scope(),
                    "Device autoprovisioned"
                );
                self.event_bus.publish(GatewayEvent::DeviceProvisioned {
                    service: device.service.clone(),
                    subservice: device.subservice.clone(),
                    device_id: device.device_id.clone(),
                    autoprovisioned: true,
                    timestamp: Utc::now().timestamp(),
                });
                Ok(device)
            }
            // Created concurrently by another frame or an operator.
            Err(StorageError::Conflict(_)) => {
                Ok(self
                    .store
                    .get_device(&group.service, &group.subservice, device_id)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn announce_processed(&self, topic: &UplinkTopic, update: &EntityUpdate) {
        debug!(
            category = "dispatcher",
            device_id = %topic.device_id,
            entity_id = %update.entity_id,
            attributes = update.attributes.len(),
            "Uplink forwarded"
        );
        self.event_bus.publish(GatewayEvent::FrameProcessed {
            application_id: topic.application_id.clone(),
            device_id: topic.device_id.clone(),
            entity_id: update.entity_id.clone(),
            attributes: update.attributes.len(),
            timestamp: Utc::now().timestamp(),
        });
    }

    fn announce_dropped(&self, connection: &ConnectionKey, frame: &UplinkFrame, error: &Error) {
        let reason = error.drop_reason();
        warn!(
            category = "dispatcher",
            broker = %connection,
            topic = %frame.topic,
            reason = %reason,
            "Dropping uplink: {}",
            error
        );
        self.event_bus.publish(GatewayEvent::FrameDropped {
            topic: frame.topic.clone(),
            reason,
            detail: error.to_string(),
            timestamp: Utc::now().timestamp(),
        });
    }
}

#[async_trait]
impl FrameHandler for UplinkDispatcher {
    async fn handle(&self, connection: &ConnectionKey, frame: UplinkFrame) {
        let results = self.process(connection, &frame).await;
        let topic = parse_uplink_topic(&frame.topic).ok();

        // Logs and events are per group; counters are per frame.
        let mut forwarded = false;
        let mut first_drop: Option<DropReason> = None;
        for result in results {
            match result {
                Ok(update) => {
                    forwarded = true;
                    if let Some(topic) = topic.as_ref() {
                        self.announce_processed(topic, &update);
                    }
                }
                Err(e) => {
                    self.announce_dropped(connection, &frame, &e);
                    first_drop.get_or_insert(e.drop_reason());
                }
            }
        }

        if forwarded {
            self.stats.record_processed();
        } else {
            self.stats
                .record_dropped(first_drop.unwrap_or(DropReason::Internal));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryContextBroker;
    use serde_json::json;

    struct Fixture {
        store: ProvisioningStore,
        registry: Arc<LiveRegistry>,
        broker: Arc<MemoryContextBroker>,
        stats: Arc<DispatchStats>,
        dispatcher: UplinkDispatcher,
    }

    async fn fixture(groups: Vec<Group>) -> Fixture {
        let store = ProvisioningStore::in_memory();
        for group in &groups {
            store.create_group(group).unwrap();
        }
        let registry = Arc::new(LiveRegistry::new());
        registry.replace_all(&groups).await;
        let broker = Arc::new(MemoryContextBroker::new());
        let stats = Arc::new(DispatchStats::new());
        let dispatcher = UplinkDispatcher::new(
            store.clone(),
            registry.clone(),
            broker.clone(),
            stats.clone(),
            EventBus::new(),
        );
        dispatcher.set_accepting(true);
        Fixture {
            store,
            registry,
            broker,
            stats,
            dispatcher,
        }
    }

    fn group(app: &str) -> Group {
        Group::new("smartgondor", "/gardens", app, "LoraDeviceGroup", "localhost")
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("localhost", 1883)
    }

    fn ttn_frame(app: &str, dev: &str, raw_b64: &str) -> UplinkFrame {
        let body = json!({ "dev_id": dev, "payload_raw": raw_b64 });
        UplinkFrame::new(format!("{app}/devices/{dev}/up"), body.to_string())
    }

    #[tokio::test]
    async fn test_frame_is_forwarded_and_device_autoprovisioned() {
        let fx = fixture(vec![group("app1")]).await;
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;

        let entity = fx
            .broker
            .entity("smartgondor", "/gardens", "devA:LoraDeviceGroup")
            .await
            .unwrap();
        assert_eq!(entity.attributes["temperature_1"].attr_type, "Number");
        assert_eq!(entity.attributes["temperature_1"].value, json!(27.2));

        let device = fx.store.get_device("smartgondor", "/gardens", "devA").unwrap();
        assert!(device.autoprovisioned);
        assert!(device.last_seen.is_some());
        assert_eq!(fx.stats.snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_unknown_application_is_dropped() {
        let fx = fixture(vec![group("app1")]).await;
        fx.dispatcher
            .handle(&key(), ttn_frame("app9", "devA", "AWcBEA=="))
            .await;

        assert_eq!(fx.broker.entity_count().await, 0);
        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.dropped_for(DropReason::UnknownApplication), 1);
        assert_eq!(snapshot.processed, 0);
    }

    #[tokio::test]
    async fn test_autoprovision_disabled() {
        let fx = fixture(vec![group("app1").with_autoprovision(false)]).await;
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(fx.stats.snapshot().dropped_for(DropReason::UnknownDevice), 1);

        fx.store
            .create_device(&Device::new("devA", "smartgondor", "/gardens", "app1"))
            .unwrap();
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(fx.stats.snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_stop_dispatch() {
        let fx = fixture(vec![group("app1")]).await;
        // Truncated temperature record.
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcB"))
            .await;
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;

        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.dropped_for(DropReason::MalformedPayload), 1);
        assert_eq!(snapshot.processed, 1);
    }

    #[tokio::test]
    async fn test_unsupported_codec_is_dropped() {
        let fx = fixture(vec![group("app1").with_codec("protobuf")]).await;
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(
            fx.stats.snapshot().dropped_for(DropReason::UnsupportedCodec),
            1
        );
    }

    #[tokio::test]
    async fn test_downstream_failure_is_dropped() {
        let fx = fixture(vec![group("app1")]).await;
        fx.broker.set_unavailable(true);
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(
            fx.stats
                .snapshot()
                .dropped_for(DropReason::DownstreamUnavailable),
            1
        );
        let device = fx.store.get_device("smartgondor", "/gardens", "devA").unwrap();
        assert!(device.last_seen.is_none());
    }

    #[tokio::test]
    async fn test_frames_rejected_when_not_accepting() {
        let fx = fixture(vec![group("app1")]).await;
        fx.dispatcher.set_accepting(false);
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(fx.stats.snapshot().dropped_for(DropReason::Internal), 1);
        assert!(fx.registry.len().await == 1);
    }

    #[tokio::test]
    async fn test_shared_application_fans_out() {
        let parks = Group::new("smartgondor", "/parks", "app1", "ParkSensor", "localhost");
        let fx = fixture(vec![group("app1"), parks]).await;
        let results = fx
            .dispatcher
            .process(&key(), &ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(fx
            .broker
            .entity("smartgondor", "/parks", "devA:ParkSensor")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_shared_application_counts_once_per_frame() {
        let parks = Group::new("smartgondor", "/parks", "app1", "ParkSensor", "localhost")
            .with_codec("protobuf");
        let fx = fixture(vec![group("app1"), parks]).await;

        // One group forwards, the other cannot decode: the frame counts as processed.
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.dropped_total(), 0);

        // Both groups fail: one drop, with the first group's reason.
        fx.broker.set_unavailable(true);
        fx.dispatcher
            .handle(&key(), ttn_frame("app1", "devA", "AWcBEA=="))
            .await;
        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.dropped_total(), 1);
    }
}
