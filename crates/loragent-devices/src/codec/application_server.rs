//! Pass-through codec for payloads already decoded by the network server.
//!
//! TTN applications can run a payload formatter and publish the result as
//! `payload_fields`. Each top-level field becomes one attribute; the JSON type
//! selects the attribute type.

use loragent_core::malformed_err;
use loragent_core::model::{attr_types, DecodedAttribute};
use loragent_core::Result;
use serde_json::{Map, Value};

fn attribute_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(attr_types::BOOLEAN),
        Value::Number(_) => Some(attr_types::NUMBER),
        Value::String(_) => Some(attr_types::TEXT),
        Value::Array(_) | Value::Object(_) => Some(attr_types::STRUCTURED_VALUE),
    }
}

/// Convert `payload_fields` into attributes. Null fields are skipped.
pub fn decode(fields: Option<&Map<String, Value>>) -> Result<Vec<DecodedAttribute>> {
    let fields = fields.ok_or_else(|| {
        malformed_err!("uplink carries no payload_fields for the application_server codec")
    })?;

    Ok(fields
        .iter()
        .filter_map(|(name, value)| {
            attribute_type(value).map(|ty| DecodedAttribute::new(name.clone(), ty, value.clone()))
        })
        .collect())
}
