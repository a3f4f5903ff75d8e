//! Table layout of the key-value backend.
//!
//! # Invariants
//! - Every finder's first filter resolves to a secondary index (or the
//!   blueprint link index); narrowing-only fields never start a lookup.
//! - Boolean finder keys use their string shadow attribute.
//! - Guard ids are `<table>#<constraint>#<value>`; link ids are
//!   `<blueprintId>#<cloudProviderId>`.

use crate::kv::{IndexSchema, TableSchema};
use crate::mapper::{attributes as attr, ItemMapper};
use crate::model::{
    ApiKey, Blueprint, CloudProvider, EntityId, EntityKind, PropertySchema, ResourceType,
    ResourceTypeCloudMapping, Stack, Team, UniqueKey,
};
use crate::repo::fields;

pub(crate) const UNIQUE_KEYS_TABLE: &str = "unique_keys";
pub(crate) const LINKS_TABLE: &str = "blueprint_cloud_providers";
pub(crate) const OWNER_ID: &str = "ownerId";
pub(crate) const LINK_PROVIDER_INDEX: &str = "cloudProviderId-index";
pub(crate) const LINK_BLUEPRINT_INDEX: &str = "blueprintId-index";

/// How a logical field is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Index keyed by the attribute alone.
    Index(&'static str),
    /// Index keyed by the attribute, sorted by `createdAt`.
    SortedIndex(&'static str),
    /// Blueprint adjacency items, by provider id.
    Link,
    /// Only narrows the result of a preceding lookup.
    Narrow,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryField {
    pub field: &'static str,
    /// String-typed attribute holding the value.
    pub attribute: &'static str,
    pub lookup: Lookup,
}

const fn indexed(field: &'static str, attribute: &'static str, index: &'static str) -> QueryField {
    QueryField {
        field,
        attribute,
        lookup: Lookup::Index(index),
    }
}

const fn sorted(field: &'static str, attribute: &'static str, index: &'static str) -> QueryField {
    QueryField {
        field,
        attribute,
        lookup: Lookup::SortedIndex(index),
    }
}

const fn narrow(field: &'static str, attribute: &'static str) -> QueryField {
    QueryField {
        field,
        attribute,
        lookup: Lookup::Narrow,
    }
}

const CLOUD_PROVIDER_FIELDS: &[QueryField] = &[
    indexed(fields::NAME, attr::NAME, "name-index"),
    sorted(fields::ENABLED, attr::ENABLED_KEY, "enabled-createdAt-index"),
];

const RESOURCE_TYPE_FIELDS: &[QueryField] = &[
    indexed(fields::NAME, attr::NAME, "name-index"),
    sorted(fields::CATEGORY, attr::CATEGORY, "category-createdAt-index"),
    sorted(fields::ENABLED, attr::ENABLED_KEY, "enabled-createdAt-index"),
];

const MAPPING_FIELDS: &[QueryField] = &[
    sorted(
        fields::RESOURCE_TYPE_ID,
        attr::RESOURCE_TYPE_ID,
        "resourceTypeId-createdAt-index",
    ),
    sorted(
        fields::CLOUD_PROVIDER_ID,
        attr::CLOUD_PROVIDER_ID,
        "cloudProviderId-createdAt-index",
    ),
];

const PROPERTY_SCHEMA_FIELDS: &[QueryField] = &[
    sorted(fields::MAPPING_ID, attr::MAPPING_ID, "mappingId-createdAt-index"),
    narrow(fields::PROPERTY_NAME, attr::PROPERTY_NAME),
    narrow(fields::REQUIRED, attr::REQUIRED_KEY),
];

const BLUEPRINT_FIELDS: &[QueryField] = &[
    indexed(fields::NAME, attr::NAME, "name-index"),
    sorted(fields::IS_ACTIVE, attr::IS_ACTIVE_KEY, "isActive-createdAt-index"),
    QueryField {
        field: fields::SUPPORTED_CLOUD_PROVIDER_ID,
        attribute: attr::SUPPORTED_CLOUD_PROVIDER_IDS,
        lookup: Lookup::Link,
    },
];

const TEAM_FIELDS: &[QueryField] = &[
    indexed(fields::NAME, attr::NAME, "name-index"),
    sorted(fields::IS_ACTIVE, attr::IS_ACTIVE_KEY, "isActive-createdAt-index"),
];

const STACK_FIELDS: &[QueryField] = &[
    sorted(fields::CREATED_BY, attr::CREATED_BY, "createdBy-createdAt-index"),
    narrow(fields::NAME, attr::NAME),
    sorted(fields::STACK_TYPE, attr::STACK_TYPE, "stackType-createdAt-index"),
    sorted(fields::TEAM_ID, attr::TEAM_ID, "teamId-createdAt-index"),
    sorted(
        fields::CLOUD_PROVIDER_ID,
        attr::CLOUD_PROVIDER_ID,
        "cloudProviderId-createdAt-index",
    ),
    sorted(fields::BLUEPRINT_ID, attr::BLUEPRINT_ID, "blueprintId-createdAt-index"),
];

const API_KEY_FIELDS: &[QueryField] = &[
    indexed(fields::KEY_HASH, attr::KEY_HASH, "keyHash-index"),
    sorted(fields::USER_EMAIL, attr::USER_EMAIL, "userEmail-createdAt-index"),
    sorted(
        fields::CREATED_BY_EMAIL,
        attr::CREATED_BY_EMAIL,
        "createdByEmail-createdAt-index",
    ),
    sorted(fields::IS_ACTIVE, attr::IS_ACTIVE_KEY, "isActive-createdAt-index"),
];

pub(crate) fn query_fields(kind: EntityKind) -> &'static [QueryField] {
    match kind {
        EntityKind::CloudProvider => CLOUD_PROVIDER_FIELDS,
        EntityKind::ResourceType => RESOURCE_TYPE_FIELDS,
        EntityKind::ResourceTypeCloudMapping => MAPPING_FIELDS,
        EntityKind::PropertySchema => PROPERTY_SCHEMA_FIELDS,
        EntityKind::Blueprint => BLUEPRINT_FIELDS,
        EntityKind::Team => TEAM_FIELDS,
        EntityKind::Stack => STACK_FIELDS,
        EntityKind::ApiKey => API_KEY_FIELDS,
    }
}

pub(crate) fn query_field(kind: EntityKind, field: &str) -> Option<&'static QueryField> {
    query_fields(kind).iter().find(|entry| entry.field == field)
}

/// Records of `kind` pointing at a record of the owning kind through
/// `field`. A delete is refused while any exist.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dependent {
    pub kind: EntityKind,
    pub field: &'static str,
}

const fn on(kind: EntityKind, field: &'static str) -> Dependent {
    Dependent { kind, field }
}

const CLOUD_PROVIDER_DEPENDENTS: &[Dependent] = &[
    on(EntityKind::ResourceTypeCloudMapping, fields::CLOUD_PROVIDER_ID),
    on(EntityKind::Stack, fields::CLOUD_PROVIDER_ID),
    on(EntityKind::Blueprint, fields::SUPPORTED_CLOUD_PROVIDER_ID),
];
const RESOURCE_TYPE_DEPENDENTS: &[Dependent] = &[on(
    EntityKind::ResourceTypeCloudMapping,
    fields::RESOURCE_TYPE_ID,
)];
const MAPPING_DEPENDENTS: &[Dependent] = &[on(EntityKind::PropertySchema, fields::MAPPING_ID)];
const BLUEPRINT_DEPENDENTS: &[Dependent] = &[on(EntityKind::Stack, fields::BLUEPRINT_ID)];
const TEAM_DEPENDENTS: &[Dependent] = &[on(EntityKind::Stack, fields::TEAM_ID)];

pub(crate) fn dependents(kind: EntityKind) -> &'static [Dependent] {
    match kind {
        EntityKind::CloudProvider => CLOUD_PROVIDER_DEPENDENTS,
        EntityKind::ResourceType => RESOURCE_TYPE_DEPENDENTS,
        EntityKind::ResourceTypeCloudMapping => MAPPING_DEPENDENTS,
        EntityKind::Blueprint => BLUEPRINT_DEPENDENTS,
        EntityKind::Team => TEAM_DEPENDENTS,
        EntityKind::PropertySchema | EntityKind::Stack | EntityKind::ApiKey => &[],
    }
}

pub(crate) fn table_base(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::CloudProvider => CloudProvider::TABLE,
        EntityKind::ResourceType => ResourceType::TABLE,
        EntityKind::ResourceTypeCloudMapping => ResourceTypeCloudMapping::TABLE,
        EntityKind::PropertySchema => PropertySchema::TABLE,
        EntityKind::Blueprint => Blueprint::TABLE,
        EntityKind::Team => Team::TABLE,
        EntityKind::Stack => Stack::TABLE,
        EntityKind::ApiKey => ApiKey::TABLE,
    }
}

/// Physical table names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableNames {
    prefix: String,
}

impl TableNames {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub(crate) fn entity(&self, kind: EntityKind) -> String {
        format!("{}{}", self.prefix, table_base(kind))
    }

    pub(crate) fn unique_keys(&self) -> String {
        format!("{}{UNIQUE_KEYS_TABLE}", self.prefix)
    }

    pub(crate) fn links(&self) -> String {
        format!("{}{LINKS_TABLE}", self.prefix)
    }

    /// Every table the backend needs, with its indexes.
    pub(crate) fn schemas(&self) -> Vec<TableSchema> {
        let mut schemas = EntityKind::all()
            .iter()
            .map(|kind| {
                let mut schema = TableSchema::new(self.entity(*kind));
                for entry in query_fields(*kind) {
                    let (name, sort_key) = match entry.lookup {
                        Lookup::Index(name) => (name, None),
                        Lookup::SortedIndex(name) => (name, Some(attr::CREATED_AT)),
                        Lookup::Link | Lookup::Narrow => continue,
                    };
                    schema.indexes.push(IndexSchema {
                        name: name.to_string(),
                        partition_key: entry.attribute.to_string(),
                        sort_key: sort_key.map(str::to_string),
                    });
                }
                schema
            })
            .collect::<Vec<_>>();
        schemas.push(TableSchema::new(self.unique_keys()));
        schemas.push(
            TableSchema::new(self.links())
                .with_index(LINK_PROVIDER_INDEX, attr::CLOUD_PROVIDER_ID, None)
                .with_index(LINK_BLUEPRINT_INDEX, attr::BLUEPRINT_ID, None),
        );
        schemas
    }
}

/// Key of the guard item protecting `key` on the entity table `table`.
pub(crate) fn guard_id(table: &str, key: &UniqueKey) -> String {
    format!("{table}#{}#{}", key.constraint, key.value)
}

pub(crate) fn link_id(blueprint_id: EntityId, cloud_provider_id: EntityId) -> String {
    format!("{blueprint_id}#{cloud_provider_id}")
}

#[cfg(test)]
mod tests {
    use super::{guard_id, query_field, Lookup, TableNames};
    use crate::model::{EntityKind, UniqueKey};
    use crate::repo::fields;

    #[test]
    fn every_entity_table_gets_its_indexes() {
        let schemas = TableNames::new("idp_").schemas();
        assert_eq!(schemas.len(), EntityKind::all().len() + 2);

        let stacks = schemas
            .iter()
            .find(|schema| schema.name == "idp_stacks")
            .expect("stacks table should be declared");
        let by_owner = stacks
            .index("createdBy-createdAt-index")
            .expect("owner index should exist");
        assert_eq!(by_owner.partition_key, "createdBy");
        assert_eq!(by_owner.sort_key.as_deref(), Some("createdAt"));
    }

    #[test]
    fn boolean_finders_use_shadow_attributes() {
        let entry = query_field(EntityKind::Team, fields::IS_ACTIVE).expect("field");
        assert_eq!(entry.attribute, "isActiveKey");
        assert_eq!(
            query_field(EntityKind::Stack, fields::NAME).map(|entry| entry.lookup),
            Some(Lookup::Narrow)
        );
    }

    #[test]
    fn guard_id_names_table_and_constraint() {
        let key = UniqueKey::single("name", "aws");
        assert_eq!(guard_id("idp_cloud_providers", &key), "idp_cloud_providers#name#aws");
    }
}
