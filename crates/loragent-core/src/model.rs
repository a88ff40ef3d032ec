//! Provisioning records and the entity update shape.
//!
//! Group records keep the wire layout of the provisioning API: LoRaWAN
//! connection settings live under `internal_attributes.lorawan`.
//!
//! ```json
//! {
//!   "service": "smartgondor",
//!   "subservice": "/gardens",
//!   "entity_type": "LoraDeviceGroup",
//!   "internal_attributes": {
//!     "lorawan": {
//!       "application_server": { "host": "localhost", "provider": "TTN" },
//!       "application_id": "app1",
//!       "data_model": "cayennelpp"
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::defaults;
use crate::error::Result;
use crate::validation_err;

/// Attribute type names understood by the context broker.
pub mod attr_types {
    pub const NUMBER: &str = "Number";
    pub const TEXT: &str = "Text";
    pub const BOOLEAN: &str = "Boolean";
    pub const STRUCTURED_VALUE: &str = "StructuredValue";
    pub const DATE_TIME: &str = "DateTime";
}

/// Name of the timestamp attribute added to every entity update.
pub const TIME_INSTANT_ATTR: &str = "TimeInstant";

/// Declared active attribute: renames a decoded `object_id` and fixes its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub object_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
}

impl AttributeMapping {
    pub fn new(
        object_id: impl Into<String>,
        name: impl Into<String>,
        attr_type: impl Into<String>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            name: name.into(),
            attr_type: attr_type.into(),
        }
    }
}

/// Attribute with a fixed value attached to every update of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
    pub value: serde_json::Value,
}

impl StaticAttribute {
    pub fn new(
        name: impl Into<String>,
        attr_type: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            attr_type: attr_type.into(),
            value: value.into(),
        }
    }
}

/// LoRaWAN network server flavour. Selects the uplink topic layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkServerProvider {
    /// The Things Network v2 MQTT API.
    #[default]
    #[serde(rename = "TTN", alias = "ttn")]
    Ttn,
}

/// MQTT endpoint of the LoRaWAN application server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationServer {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub provider: NetworkServerProvider,
}

fn default_mqtt_port() -> u16 {
    defaults::MQTT_PORT
}

fn default_data_model() -> String {
    defaults::DATA_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

/// LoRaWAN settings of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorawanSettings {
    pub application_server: ApplicationServer,
    pub application_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_eui: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_key: Option<String>,
    /// Codec identifier (e.g. `cayennelpp`).
    #[serde(default = "default_data_model")]
    pub data_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalAttributes {
    pub lorawan: LorawanSettings,
}

/// A provisioned device group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub service: String,
    pub subservice: String,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,
    #[serde(default)]
    pub static_attributes: Vec<StaticAttribute>,
    pub internal_attributes: InternalAttributes,
    /// Create device records on first uplink from an unknown device.
    #[serde(default = "default_true")]
    pub autoprovision: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// Create a group with the default codec and MQTT port.
    pub fn new(
        service: impl Into<String>,
        subservice: impl Into<String>,
        application_id: impl Into<String>,
        entity_type: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            subservice: subservice.into(),
            entity_type: entity_type.into(),
            attributes: Vec::new(),
            static_attributes: Vec::new(),
            internal_attributes: InternalAttributes {
                lorawan: LorawanSettings {
                    application_server: ApplicationServer {
                        host: host.into(),
                        port: defaults::MQTT_PORT,
                        username: None,
                        password: None,
                        provider: NetworkServerProvider::Ttn,
                    },
                    application_id: application_id.into(),
                    app_eui: None,
                    application_key: None,
                    data_model: defaults::DATA_MODEL.to_string(),
                },
            },
            autoprovision: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.internal_attributes.lorawan.application_server.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let server = &mut self.internal_attributes.lorawan.application_server;
        server.username = Some(username.into());
        server.password = Some(password.into());
        self
    }

    pub fn with_codec(mut self, codec_id: impl Into<String>) -> Self {
        self.internal_attributes.lorawan.data_model = codec_id.into();
        self
    }

    pub fn with_attribute(mut self, mapping: AttributeMapping) -> Self {
        self.attributes.push(mapping);
        self
    }

    pub fn with_static_attribute(mut self, attribute: StaticAttribute) -> Self {
        self.static_attributes.push(attribute);
        self
    }

    pub fn with_autoprovision(mut self, enabled: bool) -> Self {
        self.autoprovision = enabled;
        self
    }

    pub fn application_id(&self) -> &str {
        &self.internal_attributes.lorawan.application_id
    }

    pub fn codec_id(&self) -> &str {
        &self.internal_attributes.lorawan.data_model
    }

    pub fn application_server(&self) -> &ApplicationServer {
        &self.internal_attributes.lorawan.application_server
    }

    pub fn scope(&self) -> ServiceScope {
        ServiceScope::new(&self.service, &self.subservice)
    }

    /// Key of the transport connection this group's topics live on.
    pub fn connection_key(&self) -> ConnectionKey {
        let server = self.application_server();
        ConnectionKey {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            password: server.password.clone(),
        }
    }

    /// Wildcard topic receiving every uplink of this group's application.
    pub fn uplink_topic(&self) -> String {
        match self.application_server().provider {
            NetworkServerProvider::Ttn => format!("{}/devices/+/up", self.application_id()),
        }
    }

    /// Reject records that could never be subscribed or mapped.
    pub fn validate(&self) -> Result<()> {
        validate_scope(&self.service, &self.subservice)?;
        if self.entity_type.trim().is_empty() {
            return Err(validation_err!("entity_type must not be empty"));
        }
        let app_id = self.application_id();
        if app_id.is_empty() {
            return Err(validation_err!("lorawan.application_id must not be empty"));
        }
        if app_id.contains(['/', '+', '#']) {
            return Err(validation_err!(
                "lorawan.application_id '{}' contains a topic separator or wildcard",
                app_id
            ));
        }
        if self.application_server().host.trim().is_empty() {
            return Err(validation_err!(
                "lorawan.application_server.host must not be empty"
            ));
        }
        if self.codec_id().trim().is_empty() {
            return Err(validation_err!("lorawan.data_model must not be empty"));
        }
        Ok(())
    }
}

/// A provisioned LoRaWAN end node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub service: String,
    pub subservice: String,
    pub application_id: String,
    /// Overrides the derived `device_id:entity_type` entity name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    /// Overrides the group's entity type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_eui: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,
    #[serde(default)]
    pub static_attributes: Vec<StaticAttribute>,
    #[serde(default)]
    pub autoprovisioned: bool,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        service: impl Into<String>,
        subservice: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            service: service.into(),
            subservice: subservice.into(),
            application_id: application_id.into(),
            entity_name: None,
            entity_type: None,
            dev_eui: None,
            attributes: Vec::new(),
            static_attributes: Vec::new(),
            autoprovisioned: false,
            registered_at: Utc::now(),
            last_seen: None,
        }
    }

    /// Device record created on first uplink.
    pub fn autoprovisioned(group: &Group, device_id: impl Into<String>) -> Self {
        let mut device = Self::new(
            device_id,
            &group.service,
            &group.subservice,
            group.application_id(),
        );
        device.autoprovisioned = true;
        device
    }

    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_static_attribute(mut self, attribute: StaticAttribute) -> Self {
        self.static_attributes.push(attribute);
        self
    }

    pub fn with_attribute(mut self, mapping: AttributeMapping) -> Self {
        self.attributes.push(mapping);
        self
    }

    pub fn scope(&self) -> ServiceScope {
        ServiceScope::new(&self.service, &self.subservice)
    }

    /// Entity type for this device, falling back to the group's.
    pub fn resolve_entity_type<'a>(&'a self, group: &'a Group) -> &'a str {
        self.entity_type.as_deref().unwrap_or(&group.entity_type)
    }

    /// Entity id: `device_id:entity_type` unless explicitly overridden.
    ///
    /// Colons inside `device_id` are not escaped, so `a:b` + `T` and
    /// `a` + `b:T` both yield `a:b:T`.
    pub fn resolve_entity_name(&self, group: &Group) -> String {
        match &self.entity_name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.device_id, self.resolve_entity_type(group)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_scope(&self.service, &self.subservice)?;
        if self.device_id.is_empty() {
            return Err(validation_err!("device_id must not be empty"));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(validation_err!(
                "device_id '{}' contains a topic separator or wildcard",
                self.device_id
            ));
        }
        if self.application_id.is_empty() {
            return Err(validation_err!("application_id must not be empty"));
        }
        Ok(())
    }
}

fn validate_scope(service: &str, subservice: &str) -> Result<()> {
    if service.trim().is_empty() {
        return Err(validation_err!("service must not be empty"));
    }
    if !subservice.starts_with('/') {
        return Err(validation_err!(
            "subservice '{}' must start with '/'",
            subservice
        ));
    }
    Ok(())
}

/// (service, subservice) pair scoping provisioning records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceScope {
    pub service: String,
    pub subservice: String,
}

impl ServiceScope {
    pub fn new(service: impl Into<String>, subservice: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            subservice: subservice.into(),
        }
    }
}

impl fmt::Display for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.service, self.subservice)
    }
}

/// Identity of a physical transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Renders `user@host:port`; the password is never printed.
impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// One decoded measurement: `(name, type, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
    pub value: serde_json::Value,
}

impl DecodedAttribute {
    pub fn new(
        name: impl Into<String>,
        attr_type: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            attr_type: attr_type.into(),
            value: value.into(),
        }
    }

    pub fn number(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, attr_types::NUMBER, value)
    }
}

/// Typed attribute value as sent to the context broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    #[serde(rename = "type")]
    pub attr_type: String,
    pub value: serde_json::Value,
}

/// Normalized attribute update addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub service: String,
    pub subservice: String,
    pub entity_id: String,
    pub entity_type: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl EntityUpdate {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// NGSIv2 entity body: `{"id", "type", "<attr>": {"type", "value"}}`.
    pub fn to_ngsi_entity(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("id".into(), self.entity_id.clone().into());
        body.insert("type".into(), self.entity_type.clone().into());
        for (name, attr) in &self.attributes {
            body.insert(
                name.clone(),
                serde_json::json!({ "type": attr.attr_type, "value": attr.value }),
            );
        }
        serde_json::Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_from_provisioning_json() {
        let json = serde_json::json!({
            "service": "smartgondor",
            "subservice": "/gardens",
            "entity_type": "LoraDeviceGroup",
            "attributes": [
                { "object_id": "temperature_1", "name": "temperature_1", "type": "Number" }
            ],
            "internal_attributes": {
                "lorawan": {
                    "application_server": {
                        "host": "localhost",
                        "username": "ari_ioe_app_demo1",
                        "password": "secret",
                        "provider": "TTN"
                    },
                    "app_eui": "70B3D57ED000985F",
                    "application_id": "ari_ioe_app_demo1",
                    "application_key": "9BE6B8EF16415B5F6ED4FBEAFE695C49",
                    "data_model": "cayennelpp"
                }
            }
        });
        let group: Group = serde_json::from_value(json).unwrap();
        assert_eq!(group.application_id(), "ari_ioe_app_demo1");
        assert_eq!(group.codec_id(), "cayennelpp");
        assert_eq!(group.application_server().port, 1883);
        assert!(group.autoprovision);
        assert_eq!(group.uplink_topic(), "ari_ioe_app_demo1/devices/+/up");
        assert_eq!(
            group.connection_key().to_string(),
            "ari_ioe_app_demo1@localhost:1883"
        );
        group.validate().unwrap();
    }

    #[test]
    fn test_entity_name_derivation() {
        let group = Group::new("s", "/p", "app1", "LoraDeviceGroup", "localhost");
        let device = Device::autoprovisioned(&group, "devA");
        assert_eq!(device.resolve_entity_name(&group), "devA:LoraDeviceGroup");

        let device = device.with_entity_name("Garden:Sensor");
        assert_eq!(device.resolve_entity_name(&group), "Garden:Sensor");
    }

    #[test]
    fn test_entity_name_colon_ambiguity_is_preserved() {
        let group_a = Group::new("s", "/p", "app1", "T", "localhost");
        let group_b = Group::new("s", "/p", "app1", "b:T", "localhost");
        let dev_a = Device::autoprovisioned(&group_a, "a:b");
        let dev_b = Device::autoprovisioned(&group_b, "a");
        assert_eq!(
            dev_a.resolve_entity_name(&group_a),
            dev_b.resolve_entity_name(&group_b)
        );
    }

    #[test]
    fn test_group_validation() {
        let group = Group::new("s", "gardens", "app1", "T", "localhost");
        assert!(group.validate().is_err());

        let group = Group::new("s", "/gardens", "app/1", "T", "localhost");
        assert!(group.validate().is_err());

        let group = Group::new("s", "/gardens", "app1", "", "localhost");
        assert!(group.validate().is_err());

        let group = Group::new("s", "/gardens", "app1", "T", "localhost");
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_connection_key_identity_includes_credentials() {
        let a = Group::new("s", "/p", "app1", "T", "broker").with_credentials("u", "p1");
        let b = Group::new("s", "/p", "app2", "T", "broker").with_credentials("u", "p2");
        let c = Group::new("s", "/q", "app3", "T", "broker").with_credentials("u", "p1");
        assert_ne!(a.connection_key(), b.connection_key());
        assert_eq!(a.connection_key(), c.connection_key());
    }

    #[test]
    fn test_ngsi_entity_body() {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "temperature_1".to_string(),
            AttributeValue {
                attr_type: "Number".to_string(),
                value: serde_json::json!(27.2),
            },
        );
        let update = EntityUpdate {
            service: "s".into(),
            subservice: "/p".into(),
            entity_id: "devA:LoraDeviceGroup".into(),
            entity_type: "LoraDeviceGroup".into(),
            attributes,
        };
        let body = update.to_ngsi_entity();
        assert_eq!(body["id"], "devA:LoraDeviceGroup");
        assert_eq!(body["temperature_1"]["type"], "Number");
        assert_eq!(body["temperature_1"]["value"], 27.2);
    }
}
