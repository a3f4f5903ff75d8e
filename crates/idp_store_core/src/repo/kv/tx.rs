use super::KvStore;
use crate::error::StoreResult;
use crate::model::{EntityRecord, EntityWrite};
use crate::tx::TransactionCoordinator;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Runs a unit of work as one key-value transaction.
pub struct KvTransactionCoordinator {
    store: Arc<KvStore>,
}

impl KvTransactionCoordinator {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

impl TransactionCoordinator for KvTransactionCoordinator {
    fn execute(&self, writes: Vec<EntityWrite>) -> StoreResult<Vec<EntityRecord>> {
        let started_at = Instant::now();
        let write_count = writes.len();
        match self.store.apply(writes) {
            Ok(saved) => {
                info!(
                    "event=unit_of_work module=tx backend=dynamodb status=ok writes={} duration_ms={}",
                    write_count,
                    started_at.elapsed().as_millis()
                );
                Ok(saved)
            }
            Err(err) => {
                warn!(
                    "event=unit_of_work module=tx backend=dynamodb status=rolled_back writes={} error_type={}",
                    write_count,
                    err.error_type()
                );
                Err(err)
            }
        }
    }
}
