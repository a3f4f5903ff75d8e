use super::{check_unit_size, delete_row, map_sqlite_error, save_entity};
use crate::db::ConnectionPool;
use crate::error::StoreResult;
use crate::model::record::with_entity;
use crate::model::{EntityRecord, EntityWrite};
use crate::tx::{assign_ids, TransactionCoordinator};
use log::{info, warn};
use rusqlite::{Connection, TransactionBehavior};
use std::time::Instant;

/// Runs a unit of work inside one SQLite transaction.
///
/// Any failing write drops the transaction, which rolls everything back.
pub struct SqliteTransactionCoordinator {
    pool: ConnectionPool,
    max_record_bytes: usize,
}

impl SqliteTransactionCoordinator {
    pub fn new(pool: ConnectionPool, max_record_bytes: usize) -> Self {
        Self {
            pool,
            max_record_bytes,
        }
    }
}

impl TransactionCoordinator for SqliteTransactionCoordinator {
    fn execute(&self, mut writes: Vec<EntityWrite>) -> StoreResult<Vec<EntityRecord>> {
        let Some(first_kind) = writes.first().map(EntityWrite::kind) else {
            return Ok(Vec::new());
        };
        let started_at = Instant::now();
        let write_count = writes.len();
        // Ids first, so the item count and the applied writes agree on targets.
        assign_ids(&mut writes);

        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(first_kind, err))?;
        let items = check_unit_size(&tx, &writes)?;

        let mut saved = Vec::new();
        for (position, write) in writes.into_iter().enumerate() {
            let kind = write.kind();
            let outcome = match write {
                EntityWrite::Save(record) => {
                    save_record(&tx, record, self.max_record_bytes).map(|record| saved.push(record))
                }
                EntityWrite::Delete { kind, id } => delete_row(&tx, kind, id),
            };
            if let Err(err) = outcome {
                warn!(
                    "event=unit_of_work module=tx backend=sqlite status=rolled_back failed_write={} kind={} error_type={}",
                    position,
                    kind,
                    err.error_type()
                );
                return Err(err);
            }
        }
        tx.commit()
            .map_err(|err| map_sqlite_error(first_kind, err))?;

        info!(
            "event=unit_of_work module=tx backend=sqlite status=ok writes={} items={} duration_ms={}",
            write_count,
            items,
            started_at.elapsed().as_millis()
        );
        Ok(saved)
    }
}

fn save_record(
    conn: &Connection,
    record: EntityRecord,
    max_record_bytes: usize,
) -> StoreResult<EntityRecord> {
    with_entity!(record, entity => save_entity(conn, entity, max_record_bytes).map(EntityRecord::from))
}
