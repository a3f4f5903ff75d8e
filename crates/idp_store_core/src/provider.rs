//! Storage factory: one configuration value in, one set of repositories out.
//!
//! # Responsibility
//! - Open exactly one backend for a [`StorageConfig`] and wire every
//!   repository, the transaction coordinator and the health check to it.
//!
//! # Invariants
//! - The provider is fixed for the lifetime of a [`Storage`]; there is no
//!   hot-swap and no global state, so several contexts can coexist.
//! - Nothing is opened when configuration is invalid.
//!
//! # See also
//! - `config` for how the provider value is parsed.
//! - `health` for the report built from the health source.

use crate::config::{BackendConfig, DynamoConfig, SqliteConfig, StorageConfig, StorageProvider};
use crate::db::ConnectionPool;
use crate::error::{StoreError, StoreResult};
use crate::health::{self, HealthReport};
use crate::kv::{KvClient, MemoryKvStore, RetryingKvClient};
use crate::repo::kv::{KvRepository, KvStore, KvTransactionCoordinator};
use crate::repo::sqlite::{SqliteRepository, SqliteTransactionCoordinator};
use crate::repo::{
    ApiKeyRepository, BlueprintRepository, CloudProviderRepository, PropertySchemaRepository,
    ResourceTypeCloudMappingRepository, ResourceTypeRepository, StackRepository, TeamRepository,
};
use crate::tx::TransactionCoordinator;
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;

/// Backend handle kept for health reporting.
pub(crate) enum HealthSource {
    Sqlite(ConnectionPool),
    KeyValue {
        store: Arc<KvStore>,
        client: Arc<RetryingKvClient>,
    },
}

/// Repositories, coordinator and health source of one opened backend.
///
/// Cheap to clone; every handle is shared.
#[derive(Clone)]
pub struct Storage {
    provider: StorageProvider,
    pub cloud_providers: Arc<dyn CloudProviderRepository>,
    pub resource_types: Arc<dyn ResourceTypeRepository>,
    pub resource_type_cloud_mappings: Arc<dyn ResourceTypeCloudMappingRepository>,
    pub property_schemas: Arc<dyn PropertySchemaRepository>,
    pub blueprints: Arc<dyn BlueprintRepository>,
    pub teams: Arc<dyn TeamRepository>,
    pub stacks: Arc<dyn StackRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub transactions: Arc<dyn TransactionCoordinator>,
    health_source: Arc<HealthSource>,
}

impl Storage {
    /// Opens the backend selected by `config`.
    ///
    /// # Errors
    /// - `Configuration` when the key-value backend needs the AWS client and
    ///   the crate was built without the `dynamodb` feature.
    /// - `Connectivity`/`Backend` when the backend cannot be opened or
    ///   migrated.
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let started_at = Instant::now();
        let provider = config.provider();
        let opened = match config.backend {
            BackendConfig::Sqlite(sqlite) => Self::open_sqlite(sqlite),
            BackendConfig::DynamoDb(dynamo) => {
                connect_kv_client(&dynamo).and_then(|client| Self::open_kv(&dynamo, client))
            }
        };
        match &opened {
            Ok(_) => info!(
                "event=storage_open module=provider status=ok provider={} duration_ms={}",
                provider,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=storage_open module=provider status=error provider={} error_type={} error={}",
                provider,
                err.error_type(),
                err
            ),
        }
        opened
    }

    /// Reads configuration from the environment and opens the backend.
    pub fn from_env() -> StoreResult<Self> {
        Self::open(StorageConfig::from_env()?)
    }

    pub fn open_sqlite(config: SqliteConfig) -> StoreResult<Self> {
        let max_record_bytes = config.max_record_bytes;
        let pool = ConnectionPool::open(config)?;
        Ok(Self {
            provider: StorageProvider::Sqlite,
            cloud_providers: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            resource_types: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            resource_type_cloud_mappings: Arc::new(SqliteRepository::new(
                pool.clone(),
                max_record_bytes,
            )),
            property_schemas: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            blueprints: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            teams: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            stacks: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            api_keys: Arc::new(SqliteRepository::new(pool.clone(), max_record_bytes)),
            transactions: Arc::new(SqliteTransactionCoordinator::new(
                pool.clone(),
                max_record_bytes,
            )),
            health_source: Arc::new(HealthSource::Sqlite(pool)),
        })
    }

    /// Opens the key-value backend over an explicit client.
    ///
    /// The client is wrapped with the configured request ceiling and retry
    /// policy. Tests use this to inject faults into a [`MemoryKvStore`].
    pub fn open_kv(config: &DynamoConfig, client: Arc<dyn KvClient>) -> StoreResult<Self> {
        let client = Arc::new(RetryingKvClient::new(client, config));
        let shared: Arc<dyn KvClient> = client.clone();
        let store = Arc::new(KvStore::open(shared, &config.table_prefix)?);
        Ok(Self {
            provider: StorageProvider::DynamoDb,
            cloud_providers: Arc::new(KvRepository::new(Arc::clone(&store))),
            resource_types: Arc::new(KvRepository::new(Arc::clone(&store))),
            resource_type_cloud_mappings: Arc::new(KvRepository::new(Arc::clone(&store))),
            property_schemas: Arc::new(KvRepository::new(Arc::clone(&store))),
            blueprints: Arc::new(KvRepository::new(Arc::clone(&store))),
            teams: Arc::new(KvRepository::new(Arc::clone(&store))),
            stacks: Arc::new(KvRepository::new(Arc::clone(&store))),
            api_keys: Arc::new(KvRepository::new(Arc::clone(&store))),
            transactions: Arc::new(KvTransactionCoordinator::new(Arc::clone(&store))),
            health_source: Arc::new(HealthSource::KeyValue { store, client }),
        })
    }

    pub fn provider(&self) -> StorageProvider {
        self.provider
    }

    /// Runs one cheap read against the backend and reports saturation.
    pub fn health(&self) -> HealthReport {
        health::report(self.provider, &self.health_source)
    }
}

fn connect_kv_client(config: &DynamoConfig) -> StoreResult<Arc<dyn KvClient>> {
    if config.uses_memory_engine() {
        return Ok(Arc::new(MemoryKvStore::new()));
    }
    connect_aws(config)
}

#[cfg(feature = "dynamodb")]
fn connect_aws(config: &DynamoConfig) -> StoreResult<Arc<dyn KvClient>> {
    use crate::kv::DynamoDbClient;

    let client = DynamoDbClient::connect(config)
        .map_err(|err| StoreError::Connectivity(err.to_string()))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "dynamodb"))]
fn connect_aws(config: &DynamoConfig) -> StoreResult<Arc<dyn KvClient>> {
    use crate::config::{ConfigError, DYNAMODB_ENDPOINT_KEY};

    Err(StoreError::Configuration(ConfigError::Invalid {
        key: DYNAMODB_ENDPOINT_KEY,
        value: config.endpoint.clone().unwrap_or_default(),
        reason: "built without the `dynamodb` feature; only memory:// endpoints are available"
            .to_string(),
    }))
}
