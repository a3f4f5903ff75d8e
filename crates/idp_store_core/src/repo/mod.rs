//! Repository contract shared by both storage backends.
//!
//! # Responsibility
//! - Define the generic per-entity operations (`save`, `find_by_id`, ...).
//! - Define the named finders once, on top of the `find_by` primitive, so
//!   both backends answer them with the same semantics.
//!
//! # Invariants
//! - `save` assigns an id on first write, keeps the stored `created_at` on
//!   update, and refreshes `updated_at` every time.
//! - Finders return creation order (`created_at`, then `id`) unless the
//!   finder name says otherwise.
//! - `delete` is idempotent.
//!
//! # See also
//! - `sqlite` and `kv` submodules for the two implementations.

pub mod kv;
pub mod sqlite;

use crate::error::StoreResult;
use crate::model::property_schema::sort_for_display;
use crate::model::{
    ApiKey, Blueprint, CloudProvider, Entity, EntityId, PropertySchema, ResourceCategory,
    ResourceType, ResourceTypeCloudMapping, Stack, StackType, Team,
};

/// Logical field names accepted by [`Repository::find_by`].
pub mod fields {
    pub const NAME: &str = "name";
    pub const ENABLED: &str = "enabled";
    pub const CATEGORY: &str = "category";
    pub const RESOURCE_TYPE_ID: &str = "resource_type_id";
    pub const CLOUD_PROVIDER_ID: &str = "cloud_provider_id";
    pub const MAPPING_ID: &str = "mapping_id";
    pub const PROPERTY_NAME: &str = "property_name";
    pub const REQUIRED: &str = "required";
    pub const IS_ACTIVE: &str = "is_active";
    pub const SUPPORTED_CLOUD_PROVIDER_ID: &str = "supported_cloud_provider_id";
    pub const CREATED_BY: &str = "created_by";
    pub const STACK_TYPE: &str = "stack_type";
    pub const TEAM_ID: &str = "team_id";
    pub const BLUEPRINT_ID: &str = "blueprint_id";
    pub const KEY_HASH: &str = "key_hash";
    pub const USER_EMAIL: &str = "user_email";
    pub const CREATED_BY_EMAIL: &str = "created_by_email";
}

/// Value side of an equality filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Id(EntityId),
    Bool(bool),
}

impl FieldValue {
    /// String form used by key-value index keys and SQL text columns.
    pub fn as_key(&self) -> String {
        match self {
            Self::Text(value) => value.clone(),
            Self::Id(id) => id.to_string(),
            Self::Bool(value) => value.to_string(),
        }
    }
}

/// Equality filter on one logical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: &'static str,
    pub value: FieldValue,
}

pub fn eq_text(field: &'static str, value: &str) -> FieldFilter {
    FieldFilter {
        field,
        value: FieldValue::Text(value.to_string()),
    }
}

pub fn eq_id(field: &'static str, id: EntityId) -> FieldFilter {
    FieldFilter {
        field,
        value: FieldValue::Id(id),
    }
}

pub fn eq_bool(field: &'static str, value: bool) -> FieldFilter {
    FieldFilter {
        field,
        value: FieldValue::Bool(value),
    }
}

/// Generic operations available for every entity type.
pub trait Repository<E: Entity>: Send + Sync {
    /// Inserts or fully overwrites `entity`, returning the stored form.
    fn save(&self, entity: E) -> StoreResult<E>;

    fn find_by_id(&self, id: EntityId) -> StoreResult<Option<E>>;

    /// Every record in creation order. Administrative path on key-value
    /// backends, where it scans.
    fn find_all(&self) -> StoreResult<Vec<E>>;

    fn count(&self) -> StoreResult<u64>;

    fn exists(&self, id: EntityId) -> StoreResult<bool>;

    /// Removes the record with `id`; absent ids are a no-op.
    fn delete_by_id(&self, id: EntityId) -> StoreResult<()>;

    /// Records matching every filter, in creation order.
    ///
    /// The first filter selects the lookup path (indexed column or secondary
    /// index); the rest narrow its result.
    fn find_by(&self, filters: &[FieldFilter]) -> StoreResult<Vec<E>>;

    /// Removes `entity`; unsaved entities are a no-op.
    fn delete(&self, entity: &E) -> StoreResult<()> {
        match entity.id() {
            Some(id) => self.delete_by_id(id),
            None => Ok(()),
        }
    }

    fn find_one_by(&self, filters: &[FieldFilter]) -> StoreResult<Option<E>> {
        Ok(self.find_by(filters)?.into_iter().next())
    }
}

pub trait CloudProviderRepository: Repository<CloudProvider> {
    fn find_by_name(&self, name: &str) -> StoreResult<Option<CloudProvider>> {
        self.find_one_by(&[eq_text(fields::NAME, name)])
    }

    fn find_by_enabled(&self, enabled: bool) -> StoreResult<Vec<CloudProvider>> {
        self.find_by(&[eq_bool(fields::ENABLED, enabled)])
    }
}

pub trait ResourceTypeRepository: Repository<ResourceType> {
    fn find_by_name(&self, name: &str) -> StoreResult<Option<ResourceType>> {
        self.find_one_by(&[eq_text(fields::NAME, name)])
    }

    fn find_by_category(&self, category: ResourceCategory) -> StoreResult<Vec<ResourceType>> {
        self.find_by(&[eq_text(fields::CATEGORY, category.as_str())])
    }

    fn find_by_enabled(&self, enabled: bool) -> StoreResult<Vec<ResourceType>> {
        self.find_by(&[eq_bool(fields::ENABLED, enabled)])
    }
}

pub trait ResourceTypeCloudMappingRepository: Repository<ResourceTypeCloudMapping> {
    fn find_by_resource_type_and_cloud_provider(
        &self,
        resource_type_id: EntityId,
        cloud_provider_id: EntityId,
    ) -> StoreResult<Option<ResourceTypeCloudMapping>> {
        self.find_one_by(&[
            eq_id(fields::RESOURCE_TYPE_ID, resource_type_id),
            eq_id(fields::CLOUD_PROVIDER_ID, cloud_provider_id),
        ])
    }

    fn find_by_resource_type_id(
        &self,
        resource_type_id: EntityId,
    ) -> StoreResult<Vec<ResourceTypeCloudMapping>> {
        self.find_by(&[eq_id(fields::RESOURCE_TYPE_ID, resource_type_id)])
    }

    fn find_by_cloud_provider_id(
        &self,
        cloud_provider_id: EntityId,
    ) -> StoreResult<Vec<ResourceTypeCloudMapping>> {
        self.find_by(&[eq_id(fields::CLOUD_PROVIDER_ID, cloud_provider_id)])
    }
}

pub trait PropertySchemaRepository: Repository<PropertySchema> {
    fn find_by_mapping_id(&self, mapping_id: EntityId) -> StoreResult<Vec<PropertySchema>> {
        self.find_by(&[eq_id(fields::MAPPING_ID, mapping_id)])
    }

    /// Display order ascending, unset last, then property name.
    fn find_by_mapping_id_order_by_display_order(
        &self,
        mapping_id: EntityId,
    ) -> StoreResult<Vec<PropertySchema>> {
        let mut schemas = self.find_by_mapping_id(mapping_id)?;
        sort_for_display(&mut schemas);
        Ok(schemas)
    }

    fn find_by_mapping_id_and_required(
        &self,
        mapping_id: EntityId,
        required: bool,
    ) -> StoreResult<Vec<PropertySchema>> {
        self.find_by(&[
            eq_id(fields::MAPPING_ID, mapping_id),
            eq_bool(fields::REQUIRED, required),
        ])
    }
}

pub trait BlueprintRepository: Repository<Blueprint> {
    fn find_by_name(&self, name: &str) -> StoreResult<Option<Blueprint>> {
        self.find_one_by(&[eq_text(fields::NAME, name)])
    }

    fn find_by_is_active(&self, is_active: bool) -> StoreResult<Vec<Blueprint>> {
        self.find_by(&[eq_bool(fields::IS_ACTIVE, is_active)])
    }

    fn find_by_supported_cloud_provider_id(
        &self,
        cloud_provider_id: EntityId,
    ) -> StoreResult<Vec<Blueprint>> {
        self.find_by(&[eq_id(
            fields::SUPPORTED_CLOUD_PROVIDER_ID,
            cloud_provider_id,
        )])
    }
}

pub trait TeamRepository: Repository<Team> {
    fn find_by_name(&self, name: &str) -> StoreResult<Option<Team>> {
        self.find_one_by(&[eq_text(fields::NAME, name)])
    }

    fn find_by_is_active(&self, is_active: bool) -> StoreResult<Vec<Team>> {
        self.find_by(&[eq_bool(fields::IS_ACTIVE, is_active)])
    }
}

pub trait StackRepository: Repository<Stack> {
    fn find_by_created_by(&self, created_by: &str) -> StoreResult<Vec<Stack>> {
        self.find_by(&[eq_text(fields::CREATED_BY, created_by)])
    }

    fn find_by_stack_type(&self, stack_type: StackType) -> StoreResult<Vec<Stack>> {
        self.find_by(&[eq_text(fields::STACK_TYPE, stack_type.as_str())])
    }

    fn find_by_team_id(&self, team_id: EntityId) -> StoreResult<Vec<Stack>> {
        self.find_by(&[eq_id(fields::TEAM_ID, team_id)])
    }

    fn find_by_cloud_provider_id(&self, cloud_provider_id: EntityId) -> StoreResult<Vec<Stack>> {
        self.find_by(&[eq_id(fields::CLOUD_PROVIDER_ID, cloud_provider_id)])
    }

    fn find_by_blueprint_id(&self, blueprint_id: EntityId) -> StoreResult<Vec<Stack>> {
        self.find_by(&[eq_id(fields::BLUEPRINT_ID, blueprint_id)])
    }

    fn exists_by_name_and_created_by(&self, name: &str, created_by: &str) -> StoreResult<bool> {
        Ok(self
            .find_one_by(&[
                eq_text(fields::CREATED_BY, created_by),
                eq_text(fields::NAME, name),
            ])?
            .is_some())
    }
}

pub trait ApiKeyRepository: Repository<ApiKey> {
    fn find_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        self.find_one_by(&[eq_text(fields::KEY_HASH, key_hash)])
    }

    fn find_by_user_email(&self, user_email: &str) -> StoreResult<Vec<ApiKey>> {
        self.find_by(&[eq_text(fields::USER_EMAIL, user_email)])
    }

    fn find_by_created_by_email(&self, created_by_email: &str) -> StoreResult<Vec<ApiKey>> {
        self.find_by(&[eq_text(fields::CREATED_BY_EMAIL, created_by_email)])
    }

    fn find_by_is_active(&self, is_active: bool) -> StoreResult<Vec<ApiKey>> {
        self.find_by(&[eq_bool(fields::IS_ACTIVE, is_active)])
    }
}
