//! In-process key-value engine with DynamoDB semantics.
//!
//! # Responsibility
//! - Store items per table with sparse secondary indexes.
//! - Evaluate condition expressions and all-or-nothing transactions under
//!   one lock.
//! - Inject throttling and outages for tests.
//!
//! # Invariants
//! - A transaction holds at most [`MAX_TRANSACTION_ITEMS`] operations and
//!   targets each item at most once.
//! - Items above [`MAX_ITEM_BYTES`] are rejected before any state changes.
//! - Index key attributes must be non-empty strings when present.

use super::attribute::{item_id, item_size, AttributeValue, Item};
use super::client::{
    CancellationReason, Condition, KvClient, KvError, KvResult, TableDescription, TableSchema,
    WriteOp, MAX_ITEM_BYTES,
};
use crate::tx::MAX_TRANSACTION_ITEMS;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

type IndexEntries = BTreeMap<String, BTreeSet<(String, String)>>;

struct MemoryTable {
    schema: TableSchema,
    items: BTreeMap<String, Item>,
    indexes: HashMap<String, IndexEntries>,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|index| (index.name.clone(), IndexEntries::new()))
            .collect();
        Self {
            schema,
            items: BTreeMap::new(),
            indexes,
        }
    }

    /// `(index, partition, sort)` entries `item` belongs to.
    fn index_keys(&self, item: &Item) -> KvResult<Vec<(String, String, String)>> {
        let mut keys = Vec::new();
        for index in &self.schema.indexes {
            let Some(partition) = key_attribute(&self.schema.name, &index.partition_key, item)?
            else {
                continue;
            };
            let sort = match &index.sort_key {
                Some(sort_key) => match key_attribute(&self.schema.name, sort_key, item)? {
                    Some(sort) => sort,
                    None => continue,
                },
                None => String::new(),
            };
            keys.push((index.name.clone(), partition, sort));
        }
        Ok(keys)
    }

    fn put(&mut self, id: String, item: Item) -> KvResult<()> {
        let keys = self.index_keys(&item)?;
        self.remove(&id);
        for (index, partition, sort) in keys {
            self.indexes
                .entry(index)
                .or_default()
                .entry(partition)
                .or_default()
                .insert((sort, id.clone()));
        }
        self.items.insert(id, item);
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        let Some(previous) = self.items.remove(id) else {
            return;
        };
        // Keys were validated when the item was stored.
        if let Ok(keys) = self.index_keys(&previous) {
            for (index, partition, sort) in keys {
                if let Some(entries) = self.indexes.get_mut(&index) {
                    if let Some(members) = entries.get_mut(&partition) {
                        members.remove(&(sort, id.to_string()));
                        if members.is_empty() {
                            entries.remove(&partition);
                        }
                    }
                }
            }
        }
    }
}

fn key_attribute(table: &str, name: &str, item: &Item) -> KvResult<Option<String>> {
    match item.get(name) {
        None => Ok(None),
        Some(AttributeValue::S(value)) if !value.is_empty() => Ok(Some(value.clone())),
        Some(AttributeValue::S(_)) => Err(KvError::Validation(format!(
            "{table}: index key attribute `{name}` cannot be an empty string"
        ))),
        Some(other) => Err(KvError::Validation(format!(
            "{table}: type mismatch for index key `{name}`: expected S, got {}",
            other.type_name()
        ))),
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    throttle_next: u32,
    conflict_next: u32,
    unavailable: bool,
}

/// Thread-safe in-process engine; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryKvStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
    faults: Mutex<FaultPlan>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `requests` requests as throttled.
    pub fn throttle_next(&self, requests: u32) {
        self.faults.lock().throttle_next = requests;
    }

    /// Cancels the next `transactions` transactions as if a concurrent
    /// transaction held their first item.
    pub fn conflict_next(&self, transactions: u32) {
        self.faults.lock().conflict_next = transactions;
    }

    fn take_conflict(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.conflict_next == 0 {
            return false;
        }
        faults.conflict_next -= 1;
        true
    }

    /// Makes every request fail as if the endpoint were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    fn admit(&self) -> KvResult<()> {
        let mut faults = self.faults.lock();
        if faults.unavailable {
            return Err(KvError::Unavailable("endpoint unreachable".to_string()));
        }
        if faults.throttle_next > 0 {
            faults.throttle_next -= 1;
            return Err(KvError::Throttled(
                "provisioned throughput exceeded".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_size(table: &str, item: &Item) -> KvResult<()> {
    let bytes = item_size(item);
    if bytes > MAX_ITEM_BYTES {
        return Err(KvError::ItemTooLarge {
            table: table.to_string(),
            id: item_id(item).unwrap_or_default().to_string(),
            bytes,
            limit: MAX_ITEM_BYTES,
        });
    }
    Ok(())
}

fn require_id(table: &str, item: &Item) -> KvResult<String> {
    item_id(item)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KvError::Validation(format!("{table}: item is missing string key `id`")))
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, MemoryTable>,
    name: &str,
) -> KvResult<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| KvError::ResourceNotFound(name.to_string()))
}

impl KvClient for MemoryKvStore {
    fn create_table(&self, schema: &TableSchema) -> KvResult<()> {
        let mut tables = self.tables.lock();
        if !tables.contains_key(&schema.name) {
            tables.insert(schema.name.clone(), MemoryTable::new(schema.clone()));
            debug!(
                "event=table_create module=kv backend=memory table={} indexes={}",
                schema.name,
                schema.indexes.len()
            );
        }
        Ok(())
    }

    fn describe_table(&self, table: &str) -> KvResult<TableDescription> {
        self.admit()?;
        let tables = self.tables.lock();
        let stored = tables
            .get(table)
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        Ok(TableDescription {
            name: table.to_string(),
            status: "ACTIVE".to_string(),
            item_count: stored.items.len() as u64,
        })
    }

    fn get_item(&self, table: &str, id: &str) -> KvResult<Option<Item>> {
        self.admit()?;
        let mut tables = self.tables.lock();
        Ok(table_mut(&mut tables, table)?.items.get(id).cloned())
    }

    fn query(&self, table: &str, index: &str, partition_value: &str) -> KvResult<Vec<Item>> {
        self.admit()?;
        let mut tables = self.tables.lock();
        let stored = table_mut(&mut tables, table)?;
        let entries = stored.indexes.get(index).ok_or_else(|| {
            KvError::Validation(format!("{table}: index `{index}` does not exist"))
        })?;
        let Some(members) = entries.get(partition_value) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|(_, id)| stored.items.get(id).cloned())
            .collect())
    }

    fn scan(&self, table: &str) -> KvResult<Vec<Item>> {
        self.admit()?;
        let mut tables = self.tables.lock();
        Ok(table_mut(&mut tables, table)?
            .items
            .values()
            .cloned()
            .collect())
    }

    fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> KvResult<()> {
        self.admit()?;
        check_size(table, &item)?;
        let id = require_id(table, &item)?;
        let mut tables = self.tables.lock();
        let stored = table_mut(&mut tables, table)?;
        if let Some(condition) = condition {
            if !condition.matches(stored.items.get(&id)) {
                return Err(KvError::ConditionalCheckFailed {
                    table: table.to_string(),
                    id,
                });
            }
        }
        stored.put(id, item)
    }

    fn delete_item(&self, table: &str, id: &str, condition: Option<Condition>) -> KvResult<()> {
        self.admit()?;
        let mut tables = self.tables.lock();
        let stored = table_mut(&mut tables, table)?;
        if let Some(condition) = condition {
            if !condition.matches(stored.items.get(id)) {
                return Err(KvError::ConditionalCheckFailed {
                    table: table.to_string(),
                    id: id.to_string(),
                });
            }
        }
        stored.remove(id);
        Ok(())
    }

    fn transact_write(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        self.admit()?;
        if ops.is_empty() || ops.len() > MAX_TRANSACTION_ITEMS {
            return Err(KvError::Validation(format!(
                "transaction must hold 1 to {MAX_TRANSACTION_ITEMS} operations, got {}",
                ops.len()
            )));
        }

        let mut targets = HashSet::new();
        for op in &ops {
            if let WriteOp::Put { table, item, .. } = op {
                check_size(table, item)?;
                require_id(table, item)?;
            }
            let Some((table, id)) = op.target() else {
                continue;
            };
            if !targets.insert((table.to_string(), id.to_string())) {
                return Err(KvError::Validation(format!(
                    "transaction cannot include multiple operations on one item: {table}/{id}"
                )));
            }
        }

        if self.take_conflict() {
            let mut reasons = vec![CancellationReason::None; ops.len()];
            reasons[0] = CancellationReason::TransactionConflict;
            return Err(KvError::TransactionCanceled { reasons });
        }

        let mut tables = self.tables.lock();
        let mut reasons = Vec::with_capacity(ops.len());
        for op in &ops {
            let (table, id) = op.target().unwrap_or_default();
            let stored = table_mut(&mut tables, table)?;
            if let WriteOp::Put { item, .. } = op {
                stored.index_keys(item)?;
            }
            let passed = op
                .condition()
                .map_or(true, |condition| condition.matches(stored.items.get(id)));
            reasons.push(if passed {
                CancellationReason::None
            } else {
                CancellationReason::ConditionalCheckFailed
            });
        }
        if reasons.iter().any(|reason| *reason != CancellationReason::None) {
            return Err(KvError::TransactionCanceled { reasons });
        }

        for op in ops {
            match op {
                WriteOp::Put { table, item, .. } => {
                    let id = require_id(&table, &item)?;
                    table_mut(&mut tables, &table)?.put(id, item)?;
                }
                WriteOp::Delete { table, id, .. } => {
                    table_mut(&mut tables, &table)?.remove(&id);
                }
                WriteOp::ConditionCheck { .. } => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryKvStore;
    use crate::kv::attribute::{AttributeValue, Item};
    use crate::kv::client::{
        CancellationReason, Condition, KvClient, KvError, TableSchema, WriteOp, MAX_ITEM_BYTES,
    };

    fn item(pairs: &[(&str, &str)]) -> Item {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), AttributeValue::S(value.to_string())))
            .collect()
    }

    fn store() -> MemoryKvStore {
        let store = MemoryKvStore::new();
        store
            .create_table(
                &TableSchema::new("t").with_index("owner-createdAt-index", "owner", Some("createdAt")),
            )
            .expect("table should be created");
        store
    }

    #[test]
    fn sparse_index_skips_items_without_key() {
        let store = store();
        store
            .put_item("t", item(&[("id", "1"), ("owner", "a"), ("createdAt", "2")]), None)
            .expect("put");
        store
            .put_item("t", item(&[("id", "2"), ("owner", "a"), ("createdAt", "1")]), None)
            .expect("put");
        store
            .put_item("t", item(&[("id", "3")]), None)
            .expect("put");

        let ids = store
            .query("t", "owner-createdAt-index", "a")
            .expect("query")
            .iter()
            .map(|item| item["id"].as_s().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn overwriting_item_moves_index_entry() {
        let store = store();
        store
            .put_item("t", item(&[("id", "1"), ("owner", "a"), ("createdAt", "1")]), None)
            .expect("put");
        store
            .put_item("t", item(&[("id", "1"), ("owner", "b"), ("createdAt", "1")]), None)
            .expect("put");
        assert!(store.query("t", "owner-createdAt-index", "a").expect("query").is_empty());
        assert_eq!(store.query("t", "owner-createdAt-index", "b").expect("query").len(), 1);
    }

    #[test]
    fn failed_condition_cancels_whole_transaction() {
        let store = store();
        let ops = vec![
            WriteOp::Put {
                table: "t".to_string(),
                item: item(&[("id", "1")]),
                condition: None,
            },
            WriteOp::ConditionCheck {
                table: "t".to_string(),
                id: "missing".to_string(),
                condition: Condition::AttributeExists("id".to_string()),
            },
        ];
        let err = store.transact_write(ops).expect_err("transaction should cancel");
        assert_eq!(
            err,
            KvError::TransactionCanceled {
                reasons: vec![
                    CancellationReason::None,
                    CancellationReason::ConditionalCheckFailed
                ],
            }
        );
        assert!(store.get_item("t", "1").expect("get").is_none());
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let store = store();
        let put = WriteOp::Put {
            table: "t".to_string(),
            item: item(&[("id", "1")]),
            condition: None,
        };
        let err = store
            .transact_write(vec![put.clone(), put])
            .expect_err("duplicates should fail");
        assert!(matches!(err, KvError::Validation(_)));
    }

    #[test]
    fn oversized_item_is_rejected() {
        let store = store();
        let big = "x".repeat(MAX_ITEM_BYTES + 1);
        let err = store
            .put_item("t", item(&[("id", "1"), ("blob", &big)]), None)
            .expect_err("item should be too large");
        assert!(matches!(err, KvError::ItemTooLarge { .. }));
    }

    #[test]
    fn throttle_injection_counts_down() {
        let store = store();
        store.throttle_next(1);
        assert!(matches!(store.scan("t"), Err(KvError::Throttled(_))));
        assert!(store.scan("t").is_ok());
    }

    #[test]
    fn non_string_index_key_is_rejected() {
        let store = store();
        let mut bad = item(&[("id", "1"), ("createdAt", "1")]);
        bad.insert("owner".to_string(), AttributeValue::Bool(true));
        assert!(matches!(
            store.put_item("t", bad, None),
            Err(KvError::Validation(_))
        ));
    }
}
