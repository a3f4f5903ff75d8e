//! Catalog entities: cloud providers, resource types and their mappings.
//!
//! # Invariants
//! - `CloudProvider.name` and `ResourceType.name` are unique per kind.
//! - A mapping pairs exactly one resource type with one cloud provider, and
//!   that pair is unique.

use super::{audit_accessors, stored_enum, Entity, EntityId, EntityKind, EntityRef, UniqueKey};
use chrono::{DateTime, Utc};

stored_enum! {
    /// How a resource type may be shared between stacks.
    pub enum ResourceCategory {
        Shared => "SHARED",
        NonShared => "NON_SHARED",
        Both => "BOTH",
    }
}

stored_enum! {
    /// Where an infrastructure module for a mapping is fetched from.
    pub enum ModuleLocationType {
        Git => "GIT",
        FileSystem => "FILE_SYSTEM",
        Registry => "REGISTRY",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudProvider {
    pub id: Option<EntityId>,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CloudProvider {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for CloudProvider {
    const KIND: EntityKind = EntityKind::CloudProvider;

    audit_accessors!();

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::single("name", &self.name)]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceType {
    pub id: Option<EntityId>,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub category: ResourceCategory,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceType {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        category: ResourceCategory,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            category,
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for ResourceType {
    const KIND: EntityKind = EntityKind::ResourceType;

    audit_accessors!();

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::single("name", &self.name)]
    }
}

/// Links a resource type to the module that provisions it on one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTypeCloudMapping {
    pub id: Option<EntityId>,
    pub resource_type_id: EntityId,
    pub cloud_provider_id: EntityId,
    pub terraform_module_location: String,
    pub module_location_type: ModuleLocationType,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceTypeCloudMapping {
    pub fn new(
        resource_type_id: EntityId,
        cloud_provider_id: EntityId,
        terraform_module_location: impl Into<String>,
        module_location_type: ModuleLocationType,
    ) -> Self {
        Self {
            id: None,
            resource_type_id,
            cloud_provider_id,
            terraform_module_location: terraform_module_location.into(),
            module_location_type,
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for ResourceTypeCloudMapping {
    const KIND: EntityKind = EntityKind::ResourceTypeCloudMapping;

    audit_accessors!();

    fn references(&self) -> Vec<EntityRef> {
        vec![
            EntityRef::new(EntityKind::ResourceType, self.resource_type_id),
            EntityRef::new(EntityKind::CloudProvider, self.cloud_provider_id),
        ]
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::composite(
            "resource_type_cloud_provider",
            &[
                &self.resource_type_id.to_string(),
                &self.cloud_provider_id.to_string(),
            ],
        )]
    }
}
