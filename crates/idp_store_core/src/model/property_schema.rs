//! Per-mapping configuration property definitions.

use super::{
    audit_accessors, stored_enum, Entity, EntityId, EntityKind, EntityRef, Payload, UniqueKey,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

stored_enum! {
    pub enum PropertyDataType {
        String => "STRING",
        Number => "NUMBER",
        Boolean => "BOOLEAN",
        List => "LIST",
    }
}

/// One configurable property of a resource type on a given cloud provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    pub id: Option<EntityId>,
    pub mapping_id: EntityId,
    pub property_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub data_type: PropertyDataType,
    pub required: bool,
    pub default_value: Option<Value>,
    pub validation_rules: Option<Payload>,
    pub display_order: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PropertySchema {
    pub fn new(
        mapping_id: EntityId,
        property_name: impl Into<String>,
        display_name: impl Into<String>,
        data_type: PropertyDataType,
    ) -> Self {
        Self {
            id: None,
            mapping_id,
            property_name: property_name.into(),
            display_name: display_name.into(),
            description: None,
            data_type,
            required: false,
            default_value: None,
            validation_rules: None,
            display_order: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for PropertySchema {
    const KIND: EntityKind = EntityKind::PropertySchema;

    audit_accessors!();

    fn references(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(
            EntityKind::ResourceTypeCloudMapping,
            self.mapping_id,
        )]
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::composite(
            "mapping_property",
            &[&self.mapping_id.to_string(), &self.property_name],
        )]
    }
}

/// Orders schemas for display: `display_order` ascending with unset last,
/// then `property_name`.
pub fn sort_for_display(schemas: &mut [PropertySchema]) {
    schemas.sort_by(|left, right| {
        let left_order = left.display_order.unwrap_or(i32::MAX);
        let right_order = right.display_order.unwrap_or(i32::MAX);
        left_order
            .cmp(&right_order)
            .then_with(|| left.display_order.is_none().cmp(&right.display_order.is_none()))
            .then_with(|| left.property_name.cmp(&right.property_name))
    });
}

#[cfg(test)]
mod tests {
    use super::{sort_for_display, PropertyDataType, PropertySchema};
    use uuid::Uuid;

    fn schema(name: &str, order: Option<i32>) -> PropertySchema {
        let mut schema = PropertySchema::new(Uuid::nil(), name, name, PropertyDataType::String);
        schema.display_order = order;
        schema
    }

    #[test]
    fn display_sort_puts_unset_order_last() {
        let mut schemas = vec![
            schema("zeta", None),
            schema("beta", Some(2)),
            schema("alpha", None),
            schema("gamma", Some(1)),
            schema("max", Some(i32::MAX)),
        ];
        sort_for_display(&mut schemas);
        let names = schemas
            .iter()
            .map(|schema| schema.property_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["gamma", "beta", "max", "alpha", "zeta"]);
    }
}
