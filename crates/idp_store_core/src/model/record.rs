//! Type-erased entity envelopes used by units of work.

use super::{
    ApiKey, Blueprint, CloudProvider, Entity, EntityId, EntityKind, EntityRef, PropertySchema,
    ResourceType, ResourceTypeCloudMapping, Stack, Team, UniqueKey,
};
use chrono::{DateTime, Utc};

/// Any persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecord {
    CloudProvider(CloudProvider),
    ResourceType(ResourceType),
    ResourceTypeCloudMapping(ResourceTypeCloudMapping),
    PropertySchema(PropertySchema),
    Blueprint(Blueprint),
    Team(Team),
    Stack(Stack),
    ApiKey(ApiKey),
}

/// Runs `$body` with `$inner` bound to the concrete entity of `$record`.
macro_rules! with_entity {
    ($record:expr, $inner:ident => $body:expr) => {
        match $record {
            $crate::model::EntityRecord::CloudProvider($inner) => $body,
            $crate::model::EntityRecord::ResourceType($inner) => $body,
            $crate::model::EntityRecord::ResourceTypeCloudMapping($inner) => $body,
            $crate::model::EntityRecord::PropertySchema($inner) => $body,
            $crate::model::EntityRecord::Blueprint($inner) => $body,
            $crate::model::EntityRecord::Team($inner) => $body,
            $crate::model::EntityRecord::Stack($inner) => $body,
            $crate::model::EntityRecord::ApiKey($inner) => $body,
        }
    };
}
pub(crate) use with_entity;

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        with_entity!(self, entity => entity_kind(entity))
    }

    pub fn id(&self) -> Option<EntityId> {
        with_entity!(self, entity => entity.id())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        with_entity!(self, entity => entity.created_at())
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        with_entity!(self, entity => entity.updated_at())
    }

    pub fn references(&self) -> Vec<EntityRef> {
        with_entity!(self, entity => entity.references())
    }

    pub fn unique_keys(&self) -> Vec<UniqueKey> {
        with_entity!(self, entity => entity.unique_keys())
    }
}

fn entity_kind<E: Entity>(_: &E) -> EntityKind {
    E::KIND
}

/// Downcast from [`EntityRecord`] to one concrete entity.
pub trait FromRecord: Sized {
    fn from_record(record: EntityRecord) -> Option<Self>;
}

macro_rules! record_conversions {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl From<$variant> for EntityRecord {
                fn from(value: $variant) -> Self {
                    Self::$variant(value)
                }
            }

            impl FromRecord for $variant {
                fn from_record(record: EntityRecord) -> Option<Self> {
                    match record {
                        EntityRecord::$variant(value) => Some(value),
                        _ => None,
                    }
                }
            }
        )+
    };
}

record_conversions!(
    CloudProvider,
    ResourceType,
    ResourceTypeCloudMapping,
    PropertySchema,
    Blueprint,
    Team,
    Stack,
    ApiKey,
);

/// One write inside a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    Save(EntityRecord),
    Delete { kind: EntityKind, id: EntityId },
}

impl EntityWrite {
    pub fn save(entity: impl Into<EntityRecord>) -> Self {
        Self::Save(entity.into())
    }

    pub fn delete(kind: EntityKind, id: EntityId) -> Self {
        Self::Delete { kind, id }
    }

    /// Deletes `entity` by its identifier; `None` when it was never saved.
    pub fn delete_entity<E: Entity>(entity: &E) -> Option<Self> {
        entity.id().map(|id| Self::Delete { kind: E::KIND, id })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Save(record) => record.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }
}
