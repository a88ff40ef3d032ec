//! Decoded attributes to entity updates.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use loragent_core::model::{
    attr_types, AttributeMapping, AttributeValue, DecodedAttribute, Device, EntityUpdate, Group,
    StaticAttribute, TIME_INSTANT_ATTR,
};

/// Builds the entity update for one uplink.
pub struct EntityMapper;

impl EntityMapper {
    /// Merge static and decoded attributes into an update for `device`'s entity.
    ///
    /// Later sources win: group static attributes, then device static
    /// attributes, then decoded values. Declared mappings rename a decoded
    /// `object_id` and fix its type, device mappings taking precedence.
    pub fn map(
        group: &Group,
        device: &Device,
        decoded: Vec<DecodedAttribute>,
        arrival: DateTime<Utc>,
    ) -> EntityUpdate {
        let mut attributes = BTreeMap::new();

        let statics = group
            .static_attributes
            .iter()
            .chain(device.static_attributes.iter());
        for StaticAttribute {
            name,
            attr_type,
            value,
        } in statics
        {
            attributes.insert(
                name.clone(),
                AttributeValue {
                    attr_type: attr_type.clone(),
                    value: value.clone(),
                },
            );
        }

        for attr in decoded {
            let (name, attr_type) = match find_mapping(group, device, &attr.name) {
                Some(mapping) => (mapping.name.clone(), mapping.attr_type.clone()),
                None => (attr.name, attr.attr_type),
            };
            attributes.insert(
                name,
                AttributeValue {
                    attr_type,
                    value: attr.value,
                },
            );
        }

        attributes
            .entry(TIME_INSTANT_ATTR.to_string())
            .or_insert_with(|| AttributeValue {
                attr_type: attr_types::DATE_TIME.to_string(),
                value: arrival
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
                    .into(),
            });

        EntityUpdate {
            service: device.service.clone(),
            subservice: device.subservice.clone(),
            entity_id: device.resolve_entity_name(group),
            entity_type: device.resolve_entity_type(group).to_string(),
            attributes,
        }
    }
}

fn find_mapping<'a>(
    group: &'a Group,
    device: &'a Device,
    object_id: &str,
) -> Option<&'a AttributeMapping> {
    device
        .attributes
        .iter()
        .chain(group.attributes.iter())
        .find(|m| m.object_id == object_id)
}
