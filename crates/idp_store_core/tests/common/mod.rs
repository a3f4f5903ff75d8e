#![allow(dead_code)]

use idp_store_core::config::{DynamoConfig, SqliteConfig, StorageConfig};
use idp_store_core::kv::{KvClient, MemoryKvStore};
use idp_store_core::model::{CloudProvider, Team};
use idp_store_core::repo::Repository;
use idp_store_core::{EntityId, Storage};
use std::sync::Arc;
use tempfile::TempDir;

/// One opened backend plus whatever must outlive it.
pub struct Backend {
    pub label: &'static str,
    pub storage: Storage,
    _dir: Option<TempDir>,
}

/// File-backed SQLite with a real pool, in a fresh temp directory.
pub fn sqlite_file(pool_max_size: usize) -> Backend {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let mut config = SqliteConfig::file(dir.path().join("idp.db"));
    config.pool_max_size = pool_max_size;
    let storage = Storage::open(StorageConfig::sqlite(config)).expect("sqlite should open");
    Backend {
        label: "sqlite",
        storage,
        _dir: Some(dir),
    }
}

/// Key-value backend over an in-process engine the test can steer.
pub fn key_value() -> (Backend, Arc<MemoryKvStore>) {
    key_value_with(DynamoConfig::in_memory("it_"))
}

pub fn key_value_with(config: DynamoConfig) -> (Backend, Arc<MemoryKvStore>) {
    let engine = Arc::new(MemoryKvStore::new());
    let client: Arc<dyn KvClient> = engine.clone();
    let storage = Storage::open_kv(&config, client).expect("key-value store should open");
    (
        Backend {
            label: "dynamodb",
            storage,
            _dir: None,
        },
        engine,
    )
}

/// Both backends, freshly opened and empty.
pub fn backends() -> Vec<Backend> {
    vec![sqlite_file(8), key_value().0]
}

pub fn seed_provider(storage: &Storage, name: &str) -> EntityId {
    storage
        .cloud_providers
        .save(CloudProvider::new(name, name))
        .expect("provider should save")
        .id
        .expect("saved provider has an id")
}

pub fn seed_team(storage: &Storage, name: &str) -> EntityId {
    storage
        .teams
        .save(Team::new(name))
        .expect("team should save")
        .id
        .expect("saved team has an id")
}
