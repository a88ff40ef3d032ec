//! Reconciliation and restart behaviour of the agent.

use std::sync::Arc;
use std::time::Duration;

use loragent_core::model::{ConnectionKey, Group};
use loragent_core::GatewayConfig;
use loragent_devices::{
    desired_topics, LoraAgent, MemoryConnector, MemoryContextBroker, TransportCall,
};
use loragent_storage::ProvisioningStore;
use serde_json::json;

const SERVICE: &str = "smartgondor";
const SUBSERVICE: &str = "/gardens";

fn build_agent(
    store: ProvisioningStore,
    connector: &MemoryConnector,
    broker: &Arc<MemoryContextBroker>,
) -> LoraAgent {
    LoraAgent::builder(GatewayConfig::default())
        .store(store)
        .connector(Arc::new(connector.clone()))
        .broker(broker.clone())
        .build()
        .unwrap()
}

fn lora_group(app: &str, host: &str) -> Group {
    Group::new(SERVICE, SUBSERVICE, app, "LoraDeviceGroup", host)
}

fn uplink(dev: &str, payload_raw: &str) -> String {
    json!({ "dev_id": dev, "payload_raw": payload_raw }).to_string()
}

async fn wait_for_entity(broker: &MemoryContextBroker, entity_id: &str) {
    for _ in 0..200 {
        if broker.entity(SERVICE, SUBSERVICE, entity_id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entity {entity_id} never reached the context broker");
}

#[tokio::test]
async fn test_second_identical_reconcile_issues_no_calls() {
    let connector = MemoryConnector::new();
    let broker = Arc::new(MemoryContextBroker::new());
    let agent = build_agent(ProvisioningStore::in_memory(), &connector, &broker);

    agent
        .create_group(lora_group("app1", "ttn-eu"))
        .await
        .unwrap();
    agent
        .create_group(lora_group("app2", "ttn-eu"))
        .await
        .unwrap();
    agent
        .create_group(lora_group("app3", "ttn-us").with_credentials("user", "pass"))
        .await
        .unwrap();
    agent.start().await.unwrap();

    let before = agent.active_subscriptions().await;
    connector.clear_calls().await;

    let report = agent.reconcile().await.unwrap();
    assert!(report.is_noop());
    assert!(connector.calls().await.is_empty());
    assert_eq!(agent.active_subscriptions().await, before);

    agent.stop().await;
}

#[tokio::test]
async fn test_restart_converges_on_persisted_groups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provisioning.redb");
    let connector = MemoryConnector::new();
    let broker = Arc::new(MemoryContextBroker::new());

    {
        let agent = build_agent(ProvisioningStore::open(&path).unwrap(), &connector, &broker);
        agent.start().await.unwrap();
        agent
            .create_group(lora_group("app1", "ttn-eu"))
            .await
            .unwrap();
        agent
            .create_group(lora_group("app2", "ttn-eu"))
            .await
            .unwrap();
        agent
            .create_group(lora_group("app3", "ttn-us"))
            .await
            .unwrap();
        agent
            .delete_group(SERVICE, SUBSERVICE, "app2")
            .await
            .unwrap();
        agent
            .replace_group(lora_group("app3", "ttn-us").with_port(8883))
            .await
            .unwrap();
        agent.stop().await;
        assert_eq!(connector.open_connections().await, 0);
    }

    let store = ProvisioningStore::open(&path).unwrap();
    let expected = desired_topics(&store.list_all_groups().unwrap());
    let agent = build_agent(store, &connector, &broker);
    agent.start().await.unwrap();

    assert_eq!(agent.active_subscriptions().await, expected);
    assert_eq!(connector.active_subscriptions().await, expected);
    assert_eq!(expected.len(), 2);
    assert!(expected.contains_key(&ConnectionKey::new("ttn-us", 8883)));

    agent.stop().await;
}

#[tokio::test]
async fn test_stop_start_leaks_nothing_and_duplicates_nothing() {
    let connector = MemoryConnector::new();
    let broker = Arc::new(MemoryContextBroker::new());
    let agent = build_agent(ProvisioningStore::in_memory(), &connector, &broker);
    agent
        .create_group(lora_group("app1", "localhost"))
        .await
        .unwrap();

    for _ in 0..3 {
        agent.start().await.unwrap();
        agent.stop().await;
    }
    connector.clear_calls().await;
    agent.start().await.unwrap();

    let key = ConnectionKey::new("localhost", 1883);
    assert_eq!(
        connector.calls().await,
        vec![
            TransportCall::Connect(key.clone()),
            TransportCall::Subscribe(key.clone(), "app1/devices/+/up".to_string()),
        ]
    );
    assert_eq!(connector.open_connections().await, 1);

    agent.stop().await;
    assert_eq!(connector.open_connections().await, 0);
}

#[tokio::test]
async fn test_new_device_after_restart_is_autoprovisioned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provisioning.redb");
    let connector = MemoryConnector::new();
    let broker = Arc::new(MemoryContextBroker::new());
    let key = ConnectionKey::new("localhost", 1883);

    let agent = build_agent(ProvisioningStore::open(&path).unwrap(), &connector, &broker);
    agent
        .create_group(lora_group("app1", "localhost"))
        .await
        .unwrap();
    agent.start().await.unwrap();
    connector
        .publish(&key, "app1/devices/devA/up", uplink("devA", "AWcBEA=="))
        .await;
    wait_for_entity(&broker, "devA:LoraDeviceGroup").await;
    agent.stop().await;
    drop(agent);

    let agent = build_agent(ProvisioningStore::open(&path).unwrap(), &connector, &broker);
    agent.start().await.unwrap();
    assert!(
        connector
            .publish(&key, "app1/devices/devB/up", uplink("devB", "AWcBGA=="))
            .await
    );
    wait_for_entity(&broker, "devB:LoraDeviceGroup").await;

    let entity = broker
        .entity(SERVICE, SUBSERVICE, "devB:LoraDeviceGroup")
        .await
        .unwrap();
    assert_eq!(entity.attributes["temperature_1"].value, json!(28.0));

    let device = agent.get_device(SERVICE, SUBSERVICE, "devB").unwrap();
    assert!(device.autoprovisioned);
    assert_eq!(agent.list_devices(SERVICE, SUBSERVICE).unwrap().len(), 2);

    agent.stop().await;
}
