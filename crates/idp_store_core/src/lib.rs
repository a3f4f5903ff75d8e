//! Storage abstraction layer for provisioning metadata.
//! One repository contract, two backends (SQLite and a DynamoDB-model
//! key-value store) with identical application-visible behavior.

pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod kv;
pub mod logging;
pub mod mapper;
pub mod model;
pub mod provider;
pub mod repo;
pub mod service;
pub mod tx;

pub use config::{
    ConfigError, DynamoConfig, LoggingConfig, RetryPolicy, SqliteConfig, StorageConfig,
    StorageProvider,
};
pub use error::{StoreError, StoreResult};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use logging::{init_logging, logging_status};
pub use model::{EntityId, EntityKind, EntityRecord, EntityWrite};
pub use provider::Storage;
pub use repo::Repository;
pub use service::CatalogService;
pub use tx::TransactionCoordinator;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
