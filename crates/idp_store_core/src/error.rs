//! Backend-neutral error taxonomy returned by every repository.
//!
//! # Invariants
//! - Only key-value throttling is retried; every other failure surfaces here
//!   unmodified.
//! - A returned error implies no partial side effects were persisted.

use crate::config::ConfigError;
use crate::model::{EntityId, EntityKind};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed engine error carried by [`StoreError::Backend`].
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unreachable: {0}")]
    Connectivity(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("{kind} conflict: {message}")]
    Conflict { kind: EntityKind, message: String },

    #[error("invalid stored data: {0}")]
    Validation(String),

    #[error("storage capacity exhausted: {0}")]
    Capacity(String),

    #[error("{kind} record of {bytes} bytes exceeds the {limit} byte limit")]
    SizeLimit {
        kind: EntityKind,
        bytes: usize,
        limit: usize,
    },

    #[error("unit of work needs {items} backend items; the limit is {limit}")]
    TransactionTooLarge { items: usize, limit: usize },

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("storage backend error: {0}")]
    Backend(#[source] BackendError),
}

impl StoreError {
    pub fn conflict(kind: EntityKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: EntityId) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Short, stable name of the variant, reported by health checks.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "Connectivity",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::Validation(_) => "Validation",
            Self::Capacity(_) => "Capacity",
            Self::SizeLimit { .. } => "SizeLimit",
            Self::TransactionTooLarge { .. } => "TransactionTooLarge",
            Self::Configuration(_) => "Configuration",
            Self::Backend(_) => "Backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;
    use crate::model::EntityKind;
    use uuid::Uuid;

    #[test]
    fn not_found_names_kind_and_id() {
        let id = Uuid::nil();
        let message = StoreError::not_found(EntityKind::CloudProvider, id).to_string();
        assert!(message.contains("cloud_provider"));
        assert!(message.contains(&id.to_string()));
    }

    #[test]
    fn error_type_is_variant_name() {
        let err = StoreError::TransactionTooLarge {
            items: 101,
            limit: 100,
        };
        assert_eq!(err.error_type(), "TransactionTooLarge");
    }
}
