//! Context broker clients.
//!
//! The dispatcher only needs `upsert`. The NGSIv2 client talks to a real
//! broker over HTTP; the in-memory broker keeps the merged entities so tests
//! can inspect them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use loragent_core::model::{AttributeValue, EntityUpdate};
use loragent_core::{Error, Result};
use tokio::sync::RwLock;

/// Downstream collaborator receiving entity updates.
#[async_trait]
pub trait ContextBroker: Send + Sync {
    /// Create the entity or merge the attributes into it.
    async fn upsert(&self, update: &EntityUpdate) -> Result<()>;
}

#[cfg(feature = "http")]
pub use ngsi::NgsiContextBroker;

#[cfg(feature = "http")]
mod ngsi {
    use std::time::Duration;

    use async_trait::async_trait;
    use loragent_core::config::ContextBrokerConfig;
    use loragent_core::model::EntityUpdate;
    use loragent_core::{Error, Result};
    use reqwest::Client;
    use tracing::debug;

    use super::ContextBroker;

    const SERVICE_HEADER: &str = "Fiware-Service";
    const SERVICE_PATH_HEADER: &str = "Fiware-ServicePath";

    /// NGSIv2 client: `POST /v2/entities?options=upsert`.
    pub struct NgsiContextBroker {
        client: Client,
        base_url: String,
        timeout: Duration,
    }

    impl NgsiContextBroker {
        pub fn new(config: &ContextBrokerConfig) -> Result<Self> {
            let client = Client::builder()
                .build()
                .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
            Ok(Self {
                client,
                base_url: config.url.trim_end_matches('/').to_string(),
                timeout: config.timeout(),
            })
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }
    }

    #[async_trait]
    impl ContextBroker for NgsiContextBroker {
        async fn upsert(&self, update: &EntityUpdate) -> Result<()> {
            let url = format!("{}/v2/entities?options=upsert", self.base_url);

            let response = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .header(SERVICE_HEADER, &update.service)
                .header(SERVICE_PATH_HEADER, &update.subservice)
                .json(&update.to_ngsi_entity())
                .send()
                .await
                .map_err(|e| {
                    Error::DownstreamUnavailable(format!("context broker request failed: {}", e))
                })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::DownstreamUnavailable(format!(
                    "context broker returned {}: {}",
                    status, body
                )));
            }

            debug!(
                category = "context_broker",
                entity_id = %update.entity_id,
                attributes = update.attributes.len(),
                "Entity upserted"
            );
            Ok(())
        }
    }
}

/// Entity as held by [`MemoryContextBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub entity_type: String,
    pub attributes: HashMap<String, AttributeValue>,
}

type EntityKey = (String, String, String);

/// In-process context broker.
#[derive(Default)]
pub struct MemoryContextBroker {
    entities: RwLock<HashMap<EntityKey, StoredEntity>>,
    history: RwLock<Vec<EntityUpdate>>,
    unavailable: AtomicBool,
}

impl MemoryContextBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upsert fail with `DownstreamUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn entity(
        &self,
        service: &str,
        subservice: &str,
        entity_id: &str,
    ) -> Option<StoredEntity> {
        let key = (
            service.to_string(),
            subservice.to_string(),
            entity_id.to_string(),
        );
        self.entities.read().await.get(&key).cloned()
    }

    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Every accepted update, in arrival order.
    pub async fn updates(&self) -> Vec<EntityUpdate> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl ContextBroker for MemoryContextBroker {
    async fn upsert(&self, update: &EntityUpdate) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::DownstreamUnavailable(
                "context broker is unavailable".to_string(),
            ));
        }

        let key = (
            update.service.clone(),
            update.subservice.clone(),
            update.entity_id.clone(),
        );
        {
            let mut entities = self.entities.write().await;
            let entity = entities.entry(key).or_insert_with(|| StoredEntity {
                entity_type: update.entity_type.clone(),
                attributes: HashMap::new(),
            });
            for (name, value) in &update.attributes {
                entity.attributes.insert(name.clone(), value.clone());
            }
        }
        self.history.write().await.push(update.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn update(attr: &str, value: f64) -> EntityUpdate {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            attr.to_string(),
            AttributeValue {
                attr_type: "Number".into(),
                value: value.into(),
            },
        );
        EntityUpdate {
            service: "smartgondor".into(),
            subservice: "/gardens".into(),
            entity_id: "devA:LoraDeviceGroup".into(),
            entity_type: "LoraDeviceGroup".into(),
            attributes,
        }
    }

    #[tokio::test]
    async fn test_memory_broker_merges_attributes() {
        let broker = MemoryContextBroker::new();
        broker.upsert(&update("temperature_1", 27.2)).await.unwrap();
        broker.upsert(&update("luminosity_2", 300.0)).await.unwrap();
        broker.upsert(&update("temperature_1", 28.0)).await.unwrap();

        let entity = broker
            .entity("smartgondor", "/gardens", "devA:LoraDeviceGroup")
            .await
            .unwrap();
        assert_eq!(entity.attributes.len(), 2);
        assert_eq!(entity.attributes["temperature_1"].value, 28.0);
        assert_eq!(broker.updates().await.len(), 3);
        assert_eq!(broker.entity_count().await, 1);
    }

    #[tokio::test]
    async fn test_memory_broker_unavailable() {
        let broker = MemoryContextBroker::new();
        broker.set_unavailable(true);
        let err = broker.upsert(&update("temperature_1", 1.0)).await.unwrap_err();
        assert!(matches!(err, Error::DownstreamUnavailable(_)));
        assert_eq!(broker.entity_count().await, 0);
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_ngsi_base_url_is_normalized() {
        let config = loragent_core::config::ContextBrokerConfig {
            url: "http://orion:1026/".into(),
            timeout_secs: 5,
        };
        let broker = NgsiContextBroker::new(&config).unwrap();
        assert_eq!(broker.base_url(), "http://orion:1026");
    }
}
