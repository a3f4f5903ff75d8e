//! SQLite bootstrap, connection pooling and schema migrations.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the relational backend.
//! - Apply schema migrations in deterministic order.
//! - Bound concurrent connection use with [`ConnectionPool`].
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Repository code must not touch data before migrations succeed.
//! - Every pooled connection has `foreign_keys=ON`.

use crate::error::StoreError;
use std::time::Duration;
use thiserror::Error;

pub mod migrations;
mod open;
mod pool;

pub use open::{connect, open_db};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },

    #[error("no connection available after {waited:?} (pool max size {max_size})")]
    PoolTimeout { waited: Duration, max_size: usize },
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) if is_connectivity_failure(&err) => {
                StoreError::Connectivity(err.to_string())
            }
            DbError::Sqlite(err) => StoreError::backend(err),
            err @ DbError::UnsupportedSchemaVersion { .. } => StoreError::backend(err),
            err @ DbError::PoolTimeout { .. } => StoreError::Capacity(err.to_string()),
        }
    }
}

/// Errors meaning the database file itself cannot be reached or used.
pub(crate) fn is_connectivity_failure(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
        )
    )
}
