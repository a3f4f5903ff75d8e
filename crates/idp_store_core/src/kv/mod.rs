//! Key-value storage engine layer.
//!
//! # Responsibility
//! - Model DynamoDB items, conditions and transactions ([`attribute`],
//!   [`client`]).
//! - Provide the in-process engine ([`MemoryKvStore`]) and, behind the
//!   `dynamodb` feature, the AWS SDK client.
//! - Apply the request ceiling and throttling retry ([`RetryingKvClient`]).
//!
//! # See also
//! - `crate::repo::kv` for the repositories built on top.

pub mod attribute;
pub mod client;
#[cfg(feature = "dynamodb")]
mod dynamo;
mod memory;
mod retry;

pub use attribute::{AttributeValue, Item};
pub use client::{
    CancellationReason, Condition, IndexSchema, KvClient, KvError, KvResult, TableDescription,
    TableSchema, WriteOp, MAX_ITEM_BYTES,
};
#[cfg(feature = "dynamodb")]
pub use dynamo::DynamoDbClient;
pub use memory::MemoryKvStore;
pub use retry::{RetryingKvClient, ThroughputSnapshot};
