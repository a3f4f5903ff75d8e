use idp_store_core::config::{ConfigError, DynamoConfig, StorageConfig, StorageProvider};
use idp_store_core::kv::{
    Condition, Item, KvClient, KvResult, MemoryKvStore, TableDescription, TableSchema, WriteOp,
};
use idp_store_core::model::Team;
use idp_store_core::repo::Repository;
use idp_store_core::{HealthStatus, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<HashMap<_, _>>();
    move |key| map.get(key).cloned()
}

fn open(pairs: &[(&str, &str)]) -> Storage {
    let config = StorageConfig::from_lookup(lookup(pairs)).expect("config should parse");
    Storage::open(config).expect("storage should open")
}

#[test]
fn sqlite_provider_reports_pool_and_stack_count() {
    let storage = open(&[
        ("IDP_DATABASE_PROVIDER", "sqlite"),
        ("IDP_SQLITE_PATH", ":memory:"),
    ]);
    assert_eq!(storage.provider(), StorageProvider::Sqlite);

    let report = storage.health();
    assert_eq!(report.status, HealthStatus::Up);
    let body = report.to_json();
    assert_eq!(body["status"], "UP");
    assert_eq!(body["provider"], "sqlite");
    let check = &body["checks"][0];
    assert_eq!(check["name"], "database-sqlite");
    assert_eq!(check["status"], "UP");
    assert_eq!(check["data"]["stackCount"], 0);
    assert_eq!(check["data"]["connectionPool"]["max"], 1);
}

#[test]
fn key_value_provider_reports_throughput() {
    let storage = open(&[
        ("IDP_DATABASE_PROVIDER", "dynamodb"),
        ("IDP_DYNAMODB_REGION", "us-east-1"),
        ("IDP_DYNAMODB_ENDPOINT", "memory://health"),
        ("IDP_DYNAMODB_TABLE_PREFIX", "health_"),
    ]);
    assert_eq!(storage.provider(), StorageProvider::DynamoDb);
    storage.teams.save(Team::new("platform")).expect("team");

    let body = storage.health().to_json();
    assert_eq!(body["status"], "UP");
    let check = &body["checks"][0];
    assert_eq!(check["name"], "database-dynamodb");
    assert_eq!(check["data"]["stackCount"], 0);
    let throughput = &check["data"]["throughput"];
    for field in [
        "consumedReadUnits",
        "consumedWriteUnits",
        "throttledRequests",
        "retriedRequests",
        "inFlightRequests",
    ] {
        assert!(throughput[field].is_u64(), "missing {field}");
    }
    assert_eq!(throughput["inFlightRequests"], 0);
}

/// Engine whose point reads take `delay`, holding their request slot.
struct SlowReads {
    inner: MemoryKvStore,
    delay: Duration,
}

impl KvClient for SlowReads {
    fn create_table(&self, schema: &TableSchema) -> KvResult<()> {
        self.inner.create_table(schema)
    }

    fn describe_table(&self, table: &str) -> KvResult<TableDescription> {
        self.inner.describe_table(table)
    }

    fn get_item(&self, table: &str, id: &str) -> KvResult<Option<Item>> {
        thread::sleep(self.delay);
        self.inner.get_item(table, id)
    }

    fn query(&self, table: &str, index: &str, partition_value: &str) -> KvResult<Vec<Item>> {
        self.inner.query(table, index, partition_value)
    }

    fn scan(&self, table: &str) -> KvResult<Vec<Item>> {
        self.inner.scan(table)
    }

    fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> KvResult<()> {
        self.inner.put_item(table, item, condition)
    }

    fn delete_item(&self, table: &str, id: &str, condition: Option<Condition>) -> KvResult<()> {
        self.inner.delete_item(table, id, condition)
    }

    fn transact_write(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        self.inner.transact_write(ops)
    }
}

#[test]
fn saturated_key_value_backend_reports_down_quickly() {
    let mut config = DynamoConfig::in_memory("busy_");
    config.max_concurrency = 1;
    let client: Arc<dyn KvClient> = Arc::new(SlowReads {
        inner: MemoryKvStore::new(),
        delay: Duration::from_millis(1_500),
    });
    let storage = Storage::open_kv(&config, client).expect("key-value store should open");

    let teams = Arc::clone(&storage.teams);
    let reader = thread::spawn(move || teams.find_by_id(uuid::Uuid::new_v4()));
    thread::sleep(Duration::from_millis(200));

    let started_at = Instant::now();
    let report = storage.health();
    let elapsed = started_at.elapsed();
    assert!(elapsed < Duration::from_millis(1_200), "health took {elapsed:?}");
    assert_eq!(report.status, HealthStatus::Down);
    let data = &report.to_json()["checks"][0]["data"];
    assert_eq!(data["errorType"], "Capacity");
    assert_eq!(data["throughput"]["inFlightRequests"], 1);
    assert_eq!(data["throughput"]["retriedRequests"], 0);

    reader
        .join()
        .expect("reader thread")
        .expect("slow read completes");
    assert_eq!(storage.health().status, HealthStatus::Up);
}

#[test]
fn unsupported_provider_fails_before_opening_anything() {
    for raw in ["postgres", "SQLite", " sqlite", ""] {
        let err = StorageConfig::from_lookup(lookup(&[("IDP_DATABASE_PROVIDER", raw)]))
            .expect_err("only exact identifiers are accepted");
        assert_eq!(
            err,
            ConfigError::UnsupportedProvider {
                value: raw.to_string()
            }
        );
        let message = err.to_string();
        assert!(message.contains("sqlite") && message.contains("dynamodb"), "{message}");
    }

    let err = StorageConfig::from_lookup(lookup(&[])).expect_err("provider is required");
    assert_eq!(err, ConfigError::MissingProvider);
}

#[test]
fn missing_backend_setting_names_the_key() {
    let err = StorageConfig::from_lookup(lookup(&[("IDP_DATABASE_PROVIDER", "sqlite")]))
        .expect_err("path is required");
    assert_eq!(
        err,
        ConfigError::Missing {
            key: "IDP_SQLITE_PATH",
            provider: StorageProvider::Sqlite,
        }
    );
}
