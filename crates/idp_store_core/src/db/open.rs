//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure connection pragmas required by the relational backend.
//! - Trigger schema migrations before the first connection is handed out.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` and the configured busy timeout.
//! - `open_db` returns connections with migrations fully applied.

use super::migrations::apply_migrations;
use super::DbResult;
use crate::config::{SqliteConfig, SqliteLocation};
use log::{error, info};
use rusqlite::Connection;
use std::time::Instant;

/// Opens the configured database and applies all pending migrations.
///
/// # Side effects
/// - Creates the database file when missing.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(config: &SqliteConfig) -> DbResult<Connection> {
    let started_at = Instant::now();
    let mode = mode_label(config);
    info!("event=db_open module=db status=start mode={mode}");

    let mut conn = match connect(config) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }
    };

    match apply_migrations(&mut conn) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                mode,
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_migration_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

/// Opens and configures one connection without touching the schema.
pub fn connect(config: &SqliteConfig) -> DbResult<Connection> {
    let conn = match &config.location {
        SqliteLocation::Memory => Connection::open_in_memory()?,
        SqliteLocation::File(path) => Connection::open(path)?,
    };
    bootstrap_connection(&conn, config)?;
    Ok(conn)
}

fn bootstrap_connection(conn: &Connection, config: &SqliteConfig) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(config.busy_timeout)?;
    if let SqliteLocation::File(_) = config.location {
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    Ok(())
}

fn mode_label(config: &SqliteConfig) -> &'static str {
    match config.location {
        SqliteLocation::Memory => "memory",
        SqliteLocation::File(_) => "file",
    }
}
