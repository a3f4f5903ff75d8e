//! Key-value client contract and request types.
//!
//! # Invariants
//! - Tables are keyed by the string attribute `id`.
//! - Secondary indexes have a string partition key and an optional string
//!   sort key; items without the partition attribute are not indexed.
//! - `transact_write` is all-or-nothing.

use super::attribute::{AttributeValue, Item};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

/// Largest item the backend accepts, in bytes.
pub const MAX_ITEM_BYTES: usize = 400 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(
        mut self,
        name: impl Into<String>,
        partition_key: impl Into<String>,
        sort_key: Option<&str>,
    ) -> Self {
        self.indexes.push(IndexSchema {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: sort_key.map(str::to_string),
        });
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub status: String,
    pub item_count: u64,
}

/// Condition expression evaluated against the current item.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeExists(String),
    AttributeNotExists(String),
    Equals(String, AttributeValue),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn or(left: Condition, right: Condition) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    /// Evaluates against `item`; `None` means the item does not exist.
    pub fn matches(&self, item: Option<&Item>) -> bool {
        match self {
            Self::AttributeExists(name) => item.is_some_and(|item| item.contains_key(name)),
            Self::AttributeNotExists(name) => !item.is_some_and(|item| item.contains_key(name)),
            Self::Equals(name, expected) => {
                item.and_then(|item| item.get(name)) == Some(expected)
            }
            Self::Or(left, right) => left.matches(item) || right.matches(item),
        }
    }
}

/// One member of a `transact_write` request.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: String,
        item: Item,
        condition: Option<Condition>,
    },
    Delete {
        table: String,
        id: String,
        condition: Option<Condition>,
    },
    ConditionCheck {
        table: String,
        id: String,
        condition: Condition,
    },
}

impl WriteOp {
    /// `(table, id)` the operation targets, when the item carries an id.
    pub fn target(&self) -> Option<(&str, &str)> {
        match self {
            Self::Put { table, item, .. } => {
                super::attribute::item_id(item).map(|id| (table.as_str(), id))
            }
            Self::Delete { table, id, .. } | Self::ConditionCheck { table, id, .. } => {
                Some((table.as_str(), id.as_str()))
            }
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Self::Put { condition, .. } | Self::Delete { condition, .. } => condition.as_ref(),
            Self::ConditionCheck { condition, .. } => Some(condition),
        }
    }
}

/// Per-operation outcome of a cancelled transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    None,
    ConditionalCheckFailed,
    TransactionConflict,
    Throttled,
    Other(String),
}

impl Display for CancellationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::ConditionalCheckFailed => f.write_str("ConditionalCheckFailed"),
            Self::TransactionConflict => f.write_str("TransactionConflict"),
            Self::Throttled => f.write_str("ThrottlingError"),
            Self::Other(code) => f.write_str(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KvError {
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("conditional check failed on {table}/{id}")]
    ConditionalCheckFailed { table: String, id: String },

    #[error("transaction cancelled: [{}]", join_reasons(.reasons))]
    TransactionCanceled { reasons: Vec<CancellationReason> },

    #[error("item {table}/{id} is {bytes} bytes; the limit is {limit}")]
    ItemTooLarge {
        table: String,
        id: String,
        bytes: usize,
        limit: usize,
    },

    #[error("table not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("no request slot free after {waited_ms} ms (limit {limit})")]
    RequestLimit { waited_ms: u128, limit: usize },

    #[error("backend request failed: {0}")]
    Service(String),
}

fn join_reasons(reasons: &[CancellationReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl KvError {
    /// Rejections caused by a throughput ceiling, eligible for retry.
    /// A transaction conflict is not one: it surfaces as `Conflict` at once.
    pub fn is_throttle(&self) -> bool {
        match self {
            Self::Throttled(_) => true,
            Self::TransactionCanceled { reasons } => reasons
                .iter()
                .any(|reason| matches!(reason, CancellationReason::Throttled)),
            _ => false,
        }
    }
}

/// Minimal DynamoDB-shaped client used by the key-value repositories.
pub trait KvClient: Send + Sync {
    /// Creates `schema.name`; succeeds when the table already exists.
    fn create_table(&self, schema: &TableSchema) -> KvResult<()>;

    fn describe_table(&self, table: &str) -> KvResult<TableDescription>;

    fn get_item(&self, table: &str, id: &str) -> KvResult<Option<Item>>;

    /// Items whose `index` partition key equals `partition_value`.
    fn query(&self, table: &str, index: &str, partition_value: &str) -> KvResult<Vec<Item>>;

    fn scan(&self, table: &str) -> KvResult<Vec<Item>>;

    fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> KvResult<()>;

    fn delete_item(&self, table: &str, id: &str, condition: Option<Condition>) -> KvResult<()>;

    fn transact_write(&self, ops: Vec<WriteOp>) -> KvResult<()>;
}

#[cfg(test)]
mod tests {
    use super::{CancellationReason, Condition, KvError};
    use crate::kv::attribute::{AttributeValue, Item};

    #[test]
    fn guard_condition_accepts_absent_or_same_owner() {
        let condition = Condition::or(
            Condition::AttributeNotExists("id".to_string()),
            Condition::Equals("ownerId".to_string(), AttributeValue::S("a".to_string())),
        );
        assert!(condition.matches(None));

        let mut owned = Item::new();
        owned.insert("id".to_string(), AttributeValue::S("g".to_string()));
        owned.insert("ownerId".to_string(), AttributeValue::S("a".to_string()));
        assert!(condition.matches(Some(&owned)));

        owned.insert("ownerId".to_string(), AttributeValue::S("b".to_string()));
        assert!(!condition.matches(Some(&owned)));
    }

    #[test]
    fn cancelled_throttle_is_retryable() {
        let err = KvError::TransactionCanceled {
            reasons: vec![CancellationReason::None, CancellationReason::Throttled],
        };
        assert!(err.is_throttle());
        assert!(err.to_string().contains("ThrottlingError"));
    }

    #[test]
    fn cancelled_conflict_is_not_retryable() {
        let err = KvError::TransactionCanceled {
            reasons: vec![CancellationReason::TransactionConflict, CancellationReason::None],
        };
        assert!(!err.is_throttle());
    }
}
