//! Liveness/readiness report with backend saturation counters.
//!
//! # Responsibility
//! - Run one cheap read per invocation and describe the backend state as
//!   the health JSON body.
//!
//! # Invariants
//! - No connection, slot or other resource is held after returning.
//! - A health check waits at most [`HEALTH_ACQUIRE_TIMEOUT`] for a
//!   connection or request slot and is never retried; saturation reports
//!   `DOWN` with `errorType` `Capacity`.
//! - Field names under `data` are stable; dashboards key on them.

use crate::config::StorageProvider;
use crate::error::StoreError;
use crate::model::EntityKind;
use crate::provider::HealthSource;
use crate::repo::kv::map_kv_error;
use crate::repo::sqlite::count_rows;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Connection or request slot wait of one health check.
pub const HEALTH_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub provider: String,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    pub fn to_json(&self) -> Value {
        // Plain structs of strings and maps always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub(crate) fn report(provider: StorageProvider, source: &HealthSource) -> HealthReport {
    let (mut data, outcome) = match source {
        HealthSource::Sqlite(pool) => {
            let stats = pool.stats();
            let mut data = Map::new();
            data.insert(
                "connectionPool".to_string(),
                json!({
                    "active": stats.active,
                    "available": stats.available,
                    "awaiting": stats.awaiting,
                    "max": stats.max,
                }),
            );
            let outcome = pool
                .get_timeout(HEALTH_ACQUIRE_TIMEOUT)
                .map_err(StoreError::from)
                .and_then(|conn| count_rows(&conn, EntityKind::Stack));
            (data, outcome)
        }
        HealthSource::KeyValue { store, client } => {
            let table = store.tables().entity(EntityKind::Stack);
            let outcome = client
                .check_table(&table, HEALTH_ACQUIRE_TIMEOUT)
                .map(|description| description.item_count)
                .map_err(|err| map_kv_error(EntityKind::Stack, err));
            let throughput = client.snapshot();
            let mut data = Map::new();
            data.insert(
                "throughput".to_string(),
                json!({
                    "consumedReadUnits": throughput.consumed_read_units,
                    "consumedWriteUnits": throughput.consumed_write_units,
                    "throttledRequests": throughput.throttled_requests,
                    "retriedRequests": throughput.retried_requests,
                    "inFlightRequests": throughput.in_flight_requests,
                }),
            );
            (data, outcome)
        }
    };

    let status = match outcome {
        Ok(stack_count) => {
            data.insert("stackCount".to_string(), json!(stack_count));
            debug!(
                "event=health_check module=health provider={} status=up stack_count={}",
                provider, stack_count
            );
            HealthStatus::Up
        }
        Err(err) => {
            warn!(
                "event=health_check module=health provider={} status=down error_type={}",
                provider,
                err.error_type()
            );
            data.insert("error".to_string(), json!(err.to_string()));
            data.insert("errorType".to_string(), json!(err.error_type()));
            HealthStatus::Down
        }
    };

    HealthReport {
        status,
        provider: provider.as_str().to_string(),
        checks: vec![HealthCheck {
            name: format!("database-{provider}"),
            status,
            data,
        }],
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DynamoConfig, SqliteConfig, StorageConfig};
    use crate::kv::{KvClient, MemoryKvStore};
    use crate::model::{Stack, StackType};
    use crate::provider::Storage;
    use crate::repo::Repository;
    use std::sync::Arc;

    #[test]
    fn sqlite_report_carries_pool_fields_and_stack_count() {
        let storage = Storage::open(StorageConfig::sqlite(SqliteConfig::in_memory()))
            .expect("sqlite should open");
        storage
            .stacks
            .save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect("save");

        let body = storage.health().to_json();
        assert_eq!(body["status"], "UP");
        assert_eq!(body["provider"], "sqlite");
        let check = &body["checks"][0];
        assert_eq!(check["name"], "database-sqlite");
        assert_eq!(check["data"]["stackCount"], 1);
        for field in ["active", "available", "awaiting", "max"] {
            assert!(check["data"]["connectionPool"][field].is_u64(), "{field}");
        }
    }

    #[test]
    fn key_value_outage_reports_down_with_error_type() {
        let engine = Arc::new(MemoryKvStore::new());
        let client: Arc<dyn KvClient> = engine.clone();
        let storage = Storage::open_kv(&DynamoConfig::in_memory("h_"), client).expect("open");
        engine.set_unavailable(true);

        let report = storage.health();
        assert!(!report.is_up());
        let body = report.to_json();
        assert_eq!(body["status"], "DOWN");
        let data = &body["checks"][0]["data"];
        assert_eq!(data["errorType"], "Connectivity");
        assert!(data["throughput"]["consumedReadUnits"].is_u64());
        assert!(data["throughput"]["inFlightRequests"].is_u64());
    }
}
