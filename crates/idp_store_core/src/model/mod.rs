//! Domain records persisted through the repository contract.
//!
//! # Responsibility
//! - Define the plain entity structs shared by both storage backends.
//! - Describe each entity's references and unique constraints so backends can
//!   enforce them without knowing the concrete type.
//!
//! # Invariants
//! - References are identifiers only; no record embeds another record.
//! - `id`, `created_at` and `updated_at` are `None` until the first `save`.
//! - Timestamps are UTC with microsecond precision.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod api_key;
pub mod blueprint;
pub mod catalog;
pub mod property_schema;
pub mod record;
pub mod stack;
pub mod team;

pub use api_key::{ApiKey, ApiKeyType};
pub use blueprint::Blueprint;
pub use catalog::{
    CloudProvider, ModuleLocationType, ResourceCategory, ResourceType, ResourceTypeCloudMapping,
};
pub use property_schema::{PropertyDataType, PropertySchema};
pub use record::{EntityRecord, EntityWrite};
pub use stack::{ProgrammingLanguage, Stack, StackType};
pub use team::Team;

/// Opaque, server-assigned entity identifier.
pub type EntityId = Uuid;

/// Free-form configuration payload attached to resource-shaped entities.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Every entity type known to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    CloudProvider,
    ResourceType,
    ResourceTypeCloudMapping,
    PropertySchema,
    Blueprint,
    Team,
    Stack,
    ApiKey,
}

impl EntityKind {
    /// Stable snake_case name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudProvider => "cloud_provider",
            Self::ResourceType => "resource_type",
            Self::ResourceTypeCloudMapping => "resource_type_cloud_mapping",
            Self::PropertySchema => "property_schema",
            Self::Blueprint => "blueprint",
            Self::Team => "team",
            Self::Stack => "stack",
            Self::ApiKey => "api_key",
        }
    }

    pub fn all() -> &'static [EntityKind] {
        &[
            Self::CloudProvider,
            Self::ResourceType,
            Self::ResourceTypeCloudMapping,
            Self::PropertySchema,
            Self::Blueprint,
            Self::Team,
            Self::Stack,
            Self::ApiKey,
        ]
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier-only pointer from one entity to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

/// One unique constraint value carried by a record.
///
/// Composite constraints encode their parts as a JSON array so that
/// `("a|b", "c")` and `("a", "b|c")` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    pub constraint: &'static str,
    pub value: String,
}

impl UniqueKey {
    pub fn single(constraint: &'static str, value: &str) -> Self {
        Self {
            constraint,
            value: value.to_string(),
        }
    }

    pub fn composite(constraint: &'static str, parts: &[&str]) -> Self {
        let parts = parts
            .iter()
            .map(|part| serde_json::Value::String((*part).to_string()))
            .collect::<Vec<_>>();
        Self {
            constraint,
            value: serde_json::Value::Array(parts).to_string(),
        }
    }
}

/// Behavior shared by every persisted record.
pub trait Entity: Clone + std::fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Option<EntityId>;
    fn set_id(&mut self, id: EntityId);
    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn set_timestamps(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>);

    /// Entities this record points at. Saving fails if any is absent.
    fn references(&self) -> Vec<EntityRef> {
        Vec::new()
    }

    /// Values that must be unique across all records of this kind.
    fn unique_keys(&self) -> Vec<UniqueKey> {
        Vec::new()
    }
}

/// Expands to the id/timestamp accessors of [`Entity`] for a struct that
/// carries `id`, `created_at` and `updated_at` fields.
macro_rules! audit_accessors {
    () => {
        fn id(&self) -> Option<$crate::model::EntityId> {
            self.id
        }

        fn set_id(&mut self, id: $crate::model::EntityId) {
            self.id = Some(id);
        }

        fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            self.created_at
        }

        fn updated_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            self.updated_at
        }

        fn set_timestamps(
            &mut self,
            created_at: chrono::DateTime<chrono::Utc>,
            updated_at: chrono::DateTime<chrono::Utc>,
        ) {
            self.created_at = Some(created_at);
            self.updated_at = Some(updated_at);
        }
    };
}
pub(crate) use audit_accessors;

/// Declares a closed enum stored by its canonical `SCREAMING_SNAKE_CASE` name.
macro_rules! stored_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Canonical stored form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parses the canonical stored form. Matching is exact.
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn all() -> &'static [$name] {
                &[$(Self::$variant),+]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
pub(crate) use stored_enum;

/// Current time truncated to the precision both backends store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 form; lexical order equals chronological order.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Sorts records into creation order: `created_at`, then `id`.
pub fn sort_by_creation<E: Entity>(records: &mut [E]) {
    records.sort_by(|left, right| {
        left.created_at()
            .cmp(&right.created_at())
            .then_with(|| left.id().cmp(&right.id()))
    });
}

#[cfg(test)]
mod tests {
    use super::{format_timestamp, now, parse_timestamp, UniqueKey};

    #[test]
    fn timestamps_roundtrip_at_micro_precision() {
        let value = now();
        let text = format_timestamp(&value);
        assert!(text.ends_with('Z'));
        assert_eq!(parse_timestamp(&text), Some(value));
    }

    #[test]
    fn composite_unique_keys_do_not_collide_on_separators() {
        let left = UniqueKey::composite("name_owner", &["a|b", "c"]);
        let right = UniqueKey::composite("name_owner", &["a", "b|c"]);
        assert_ne!(left.value, right.value);
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_none());
    }
}
