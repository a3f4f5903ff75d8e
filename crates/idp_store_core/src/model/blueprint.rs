use super::{audit_accessors, Entity, EntityId, EntityKind, EntityRef, UniqueKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Reusable stack template, valid on a set of cloud providers.
#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    pub id: Option<EntityId>,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub supported_cloud_provider_ids: BTreeSet<EntityId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            is_active: true,
            supported_cloud_provider_ids: BTreeSet::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Blueprint {
    const KIND: EntityKind = EntityKind::Blueprint;

    audit_accessors!();

    fn references(&self) -> Vec<EntityRef> {
        self.supported_cloud_provider_ids
            .iter()
            .map(|id| EntityRef::new(EntityKind::CloudProvider, *id))
            .collect()
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::single("name", &self.name)]
    }
}
