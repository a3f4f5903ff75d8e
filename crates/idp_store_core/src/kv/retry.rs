//! Request ceiling, throttling retry and throughput counters around a
//! [`KvClient`].
//!
//! # Responsibility
//! - Cap in-flight requests; callers wait for a slot up to the acquisition
//!   timeout.
//! - Retry throttled requests with exponential backoff, a bounded number of
//!   times.
//! - Track consumed capacity units for the health report.
//!
//! # Invariants
//! - Only throttling is retried. Every other error passes through unchanged.
//! - `check_table` never retries and has its own slot deadline.
//! - A request holds its slot across retries and releases it on return.

use super::attribute::{item_size, Item};
use super::client::{Condition, KvClient, KvError, KvResult, TableDescription, TableSchema, WriteOp};
use crate::config::{DynamoConfig, RetryPolicy};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const READ_UNIT_BYTES: usize = 4 * 1024;
const WRITE_UNIT_BYTES: usize = 1024;

/// Point-in-time throughput counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThroughputSnapshot {
    pub consumed_read_units: u64,
    pub consumed_write_units: u64,
    pub throttled_requests: u64,
    pub retried_requests: u64,
    pub in_flight_requests: u64,
}

#[derive(Default)]
struct ThroughputMetrics {
    consumed_read_units: AtomicU64,
    consumed_write_units: AtomicU64,
    throttled_requests: AtomicU64,
    retried_requests: AtomicU64,
}

fn units(bytes: usize, unit: usize) -> u64 {
    bytes.div_ceil(unit).max(1) as u64
}

fn read_units<'a>(items: impl IntoIterator<Item = &'a Item>) -> u64 {
    units(items.into_iter().map(item_size).sum(), READ_UNIT_BYTES)
}

fn write_units(op: &WriteOp) -> u64 {
    match op {
        WriteOp::Put { item, .. } => units(item_size(item), WRITE_UNIT_BYTES),
        WriteOp::Delete { .. } | WriteOp::ConditionCheck { .. } => 1,
    }
}

struct RequestLimiter {
    max: usize,
    timeout: Duration,
    in_flight: Mutex<usize>,
    released: Condvar,
}

struct RequestSlot<'a> {
    limiter: &'a RequestLimiter,
}

impl RequestLimiter {
    fn acquire(&self) -> KvResult<RequestSlot<'_>> {
        self.acquire_within(self.timeout)
    }

    fn acquire_within(&self, timeout: Duration) -> KvResult<RequestSlot<'_>> {
        let started_at = Instant::now();
        let deadline = started_at + timeout;
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= self.max {
            if self.released.wait_until(&mut in_flight, deadline).timed_out()
                && *in_flight >= self.max
            {
                warn!(
                    "event=kv_acquire module=kv status=timeout waited_ms={} limit={}",
                    started_at.elapsed().as_millis(),
                    self.max
                );
                return Err(KvError::RequestLimit {
                    waited_ms: started_at.elapsed().as_millis(),
                    limit: self.max,
                });
            }
        }
        *in_flight += 1;
        Ok(RequestSlot { limiter: self })
    }
}

impl Drop for RequestSlot<'_> {
    fn drop(&mut self) {
        *self.limiter.in_flight.lock() -= 1;
        self.limiter.released.notify_one();
    }
}

/// [`KvClient`] decorator applying the request ceiling and retry policy.
pub struct RetryingKvClient {
    inner: Arc<dyn KvClient>,
    policy: RetryPolicy,
    limiter: RequestLimiter,
    metrics: ThroughputMetrics,
}

impl RetryingKvClient {
    pub fn new(inner: Arc<dyn KvClient>, config: &DynamoConfig) -> Self {
        Self {
            inner,
            policy: config.retry,
            limiter: RequestLimiter {
                max: config.max_concurrency.max(1),
                timeout: config.acquire_timeout,
                in_flight: Mutex::new(0),
                released: Condvar::new(),
            },
            metrics: ThroughputMetrics::default(),
        }
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            consumed_read_units: self.metrics.consumed_read_units.load(Ordering::Relaxed),
            consumed_write_units: self.metrics.consumed_write_units.load(Ordering::Relaxed),
            throttled_requests: self.metrics.throttled_requests.load(Ordering::Relaxed),
            retried_requests: self.metrics.retried_requests.load(Ordering::Relaxed),
            in_flight_requests: *self.limiter.in_flight.lock() as u64,
        }
    }

    fn run<T>(&self, operation: &str, mut request: impl FnMut() -> KvResult<T>) -> KvResult<T> {
        let _slot = self.limiter.acquire()?;
        let mut attempt = 0;
        loop {
            let err = match request() {
                Err(err) if err.is_throttle() => err,
                other => return other,
            };
            self.metrics.throttled_requests.fetch_add(1, Ordering::Relaxed);

            if attempt >= self.policy.max_retries {
                warn!(
                    "event=kv_request module=kv status=throttled operation={} attempts={}",
                    operation,
                    attempt + 1
                );
                return Err(match err {
                    KvError::Throttled(message) => KvError::Throttled(format!(
                        "{operation}: retries exhausted after {} attempts: {message}",
                        attempt + 1
                    )),
                    other => other,
                });
            }

            let delay = self.policy.backoff_for(attempt);
            debug!(
                "event=kv_retry module=kv status=backoff operation={} attempt={} delay_ms={}",
                operation,
                attempt + 1,
                delay.as_millis()
            );
            self.metrics.retried_requests.fetch_add(1, Ordering::Relaxed);
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Describes `table` with one attempt, waiting at most `timeout` for a
    /// slot. Health reporting uses it so that a saturated backend reports
    /// `RequestLimit` instead of queueing behind the load it measures.
    pub fn check_table(&self, table: &str, timeout: Duration) -> KvResult<TableDescription> {
        let _slot = self.limiter.acquire_within(timeout)?;
        let outcome = self.inner.describe_table(table);
        if matches!(&outcome, Err(err) if err.is_throttle()) {
            self.metrics.throttled_requests.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn consume_read(&self, units: u64) {
        self.metrics
            .consumed_read_units
            .fetch_add(units, Ordering::Relaxed);
    }

    fn consume_write(&self, units: u64) {
        self.metrics
            .consumed_write_units
            .fetch_add(units, Ordering::Relaxed);
    }
}

impl KvClient for RetryingKvClient {
    fn create_table(&self, schema: &TableSchema) -> KvResult<()> {
        self.run("create_table", || self.inner.create_table(schema))
    }

    fn describe_table(&self, table: &str) -> KvResult<TableDescription> {
        self.run("describe_table", || self.inner.describe_table(table))
    }

    fn get_item(&self, table: &str, id: &str) -> KvResult<Option<Item>> {
        let item = self.run("get_item", || self.inner.get_item(table, id))?;
        self.consume_read(read_units(item.as_ref()));
        Ok(item)
    }

    fn query(&self, table: &str, index: &str, partition_value: &str) -> KvResult<Vec<Item>> {
        let items = self.run("query", || self.inner.query(table, index, partition_value))?;
        self.consume_read(read_units(&items));
        Ok(items)
    }

    fn scan(&self, table: &str) -> KvResult<Vec<Item>> {
        let items = self.run("scan", || self.inner.scan(table))?;
        self.consume_read(read_units(&items));
        Ok(items)
    }

    fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> KvResult<()> {
        let consumed = units(item_size(&item), WRITE_UNIT_BYTES);
        self.run("put_item", || {
            self.inner.put_item(table, item.clone(), condition.clone())
        })?;
        self.consume_write(consumed);
        Ok(())
    }

    fn delete_item(&self, table: &str, id: &str, condition: Option<Condition>) -> KvResult<()> {
        self.run("delete_item", || {
            self.inner.delete_item(table, id, condition.clone())
        })?;
        self.consume_write(1);
        Ok(())
    }

    fn transact_write(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        // Transactional writes cost two units per item.
        let consumed = ops.iter().map(write_units).sum::<u64>() * 2;
        self.run("transact_write", || self.inner.transact_write(ops.clone()))?;
        self.consume_write(consumed);
        Ok(())
    }
}
