//! Bounded SQLite connection pool.
//!
//! # Responsibility
//! - Hand out at most `max_size` connections at a time.
//! - Block callers until a connection frees up or the acquisition timeout
//!   elapses.
//!
//! # Invariants
//! - `active + available <= max_size` at all times.
//! - A connection returns to the idle list when its guard drops.
//! - An in-memory database is private to its connection, so `:memory:`
//!   pools are pinned to a single connection.

use super::{connect, open_db, DbError, DbResult};
use crate::config::{SqliteConfig, SqliteLocation};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Idle connections ready for reuse.
    pub available: usize,
    /// Callers blocked waiting for a connection.
    pub awaiting: usize,
    pub max: usize,
}

struct PoolState {
    idle: Vec<Connection>,
    total: usize,
    awaiting: usize,
}

struct PoolShared {
    config: SqliteConfig,
    max_size: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Opens the first connection (running migrations) and builds the pool.
    pub fn open(config: SqliteConfig) -> DbResult<Self> {
        let first = open_db(&config)?;
        let max_size = match config.location {
            SqliteLocation::Memory => 1,
            SqliteLocation::File(_) => config.pool_max_size.max(1),
        };

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                max_size,
                state: Mutex::new(PoolState {
                    idle: vec![first],
                    total: 1,
                    awaiting: 0,
                }),
                released: Condvar::new(),
            }),
        })
    }

    /// Acquires a connection, waiting up to the configured timeout.
    pub fn get(&self) -> DbResult<PooledConnection> {
        self.get_timeout(self.shared.config.acquire_timeout)
    }

    /// Acquires a connection, waiting up to `timeout`.
    ///
    /// # Errors
    /// - `DbError::PoolTimeout` when every connection stays busy for `timeout`.
    /// - SQLite errors when a new connection cannot be opened.
    pub fn get_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let started_at = Instant::now();
        let deadline = started_at + timeout;
        let mut state = self.shared.state.lock();

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(self.guard(conn));
            }

            if state.total < self.shared.max_size {
                state.total += 1;
                drop(state);
                return match connect(&self.shared.config) {
                    Ok(conn) => {
                        debug!(
                            "event=pool_grow module=db status=ok max_size={}",
                            self.shared.max_size
                        );
                        Ok(self.guard(conn))
                    }
                    Err(err) => {
                        self.shared.state.lock().total -= 1;
                        self.shared.released.notify_one();
                        Err(err)
                    }
                };
            }

            state.awaiting += 1;
            let timed_out = self
                .shared
                .released
                .wait_until(&mut state, deadline)
                .timed_out();
            state.awaiting -= 1;

            if timed_out && state.idle.is_empty() {
                warn!(
                    "event=pool_acquire module=db status=timeout waited_ms={} max_size={}",
                    started_at.elapsed().as_millis(),
                    self.shared.max_size
                );
                return Err(DbError::PoolTimeout {
                    waited: started_at.elapsed(),
                    max_size: self.shared.max_size,
                });
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            active: state.total - state.idle.len(),
            available: state.idle.len(),
            awaiting: state.awaiting,
            max: self.shared.max_size,
        }
    }

    fn guard(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.shared.state.lock();
            if conn.is_autocommit() {
                state.idle.push(conn);
            } else {
                // A transaction leaked past its guard; discard the handle.
                state.total -= 1;
            }
            drop(state);
            self.shared.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionPool;
    use crate::config::SqliteConfig;
    use crate::db::DbError;
    use std::time::Duration;

    fn file_config(max: usize) -> (tempfile::TempDir, SqliteConfig) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let mut config = SqliteConfig::file(dir.path().join("pool.db"));
        config.pool_max_size = max;
        config.acquire_timeout = Duration::from_millis(50);
        (dir, config)
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (_dir, config) = file_config(2);
        let pool = ConnectionPool::open(config).expect("pool should open");

        let first = pool.get().expect("first connection");
        let second = pool.get().expect("second connection");
        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.max, 2);

        let err = pool.get().err().expect("third acquire should time out");
        assert!(matches!(err, DbError::PoolTimeout { max_size: 2, .. }));

        drop(first);
        drop(second);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn released_connection_wakes_waiter() {
        let (_dir, mut config) = file_config(1);
        config.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::open(config).expect("pool should open");
        let held = pool.get().expect("connection");

        let waiter_pool = pool.clone();
        let waiter = std::thread::spawn(move || waiter_pool.get().map(|_| ()));
        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        waiter
            .join()
            .expect("waiter thread should not panic")
            .expect("waiter should get the released connection");
    }

    #[test]
    fn memory_pool_is_pinned_to_one_connection() {
        let pool = ConnectionPool::open(SqliteConfig::in_memory()).expect("pool should open");
        assert_eq!(pool.stats().max, 1);
    }
}
