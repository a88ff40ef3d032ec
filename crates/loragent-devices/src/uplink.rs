//! Uplink frames and the TTN message envelope.

use base64::Engine;
use chrono::{DateTime, Utc};
use loragent_core::{malformed_err, Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// One message as received from the transport, before any parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkFrame {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl UplinkFrame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Identity extracted from an uplink topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkTopic {
    pub application_id: String,
    pub device_id: String,
}

/// Parse `<application_id>/devices/<device_id>/up`.
pub fn parse_uplink_topic(topic: &str) -> Result<UplinkTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [app, "devices", dev, "up"] if !app.is_empty() && !dev.is_empty() => Ok(UplinkTopic {
            application_id: app.to_string(),
            device_id: dev.to_string(),
        }),
        _ => Err(Error::UnknownApplication(format!(
            "topic '{}' is not an uplink topic",
            topic
        ))),
    }
}

/// TTN v2 uplink message. Only the fields the gateway reads are declared.
#[derive(Debug, Clone, Deserialize)]
struct TtnUplink {
    #[serde(default)]
    dev_id: Option<String>,
    #[serde(default)]
    hardware_serial: Option<String>,
    #[serde(default)]
    payload_raw: Option<String>,
    #[serde(default)]
    payload_fields: Option<Map<String, Value>>,
}

/// Decoder input extracted from a frame body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UplinkPayload {
    /// Application payload bytes (`payload_raw`, base64-decoded).
    pub raw: Vec<u8>,
    /// Fields already decoded by the network server.
    pub fields: Option<Map<String, Value>>,
    pub dev_id: Option<String>,
    pub dev_eui: Option<String>,
}

impl UplinkPayload {
    /// Parse a frame body.
    ///
    /// A JSON object is read as a TTN envelope. Anything else is taken as
    /// the raw application payload.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value = match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                return Ok(Self {
                    raw: body.to_vec(),
                    ..Self::default()
                })
            }
        };

        let message: TtnUplink = serde_json::from_value(value)
            .map_err(|e| malformed_err!("invalid uplink envelope: {}", e))?;

        let raw = match message.payload_raw.as_deref() {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| malformed_err!("payload_raw is not valid base64: {}", e))?,
            None => Vec::new(),
        };

        Ok(Self {
            raw,
            fields: message.payload_fields,
            dev_id: message.dev_id,
            dev_eui: message.hardware_serial,
        })
    }
}
