use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::error::BackendError;
use crate::error::StoreError;
use crate::lock::LockLease;
use crate::types::RangeSpec;
use crate::types::RangeUpdate;
use crate::types::Row;
use crate::types::RowOffset;

/// The raw tabular API of the remote row store.
///
/// Implementations translate calls into whatever the backend speaks and report failures as [`BackendError`] kinds.
/// Retrying, chunking and header checks are the business of [`RowStoreClient`](crate::client::RowStoreClient);
/// implementations must not retry on their own.
#[async_trait]
pub trait RowBackend: Send + Sync + 'static {
    async fn read_range(&self, range: &RangeSpec) -> Result<Vec<Row>, BackendError>;

    /// Reads several ranges in one round-trip. The result must contain exactly one entry per requested range, in
    /// request order.
    async fn batch_read(&self, ranges: &[RangeSpec]) -> Result<Vec<Vec<Row>>, BackendError>;

    /// Returns the number of updated cells.
    async fn batch_write(&self, updates: &[RangeUpdate]) -> Result<usize, BackendError>;

    /// Appends a row after the last row of the table and returns its offset.
    async fn append_row(&self, table: &str, row: Row) -> Result<RowOffset, BackendError>;

    /// Time of the last modification of the table, if the backend tracks it.
    async fn modified_at(&self, _table: &str) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(None)
    }
}

/// Named mutual exclusion shared by everybody writing to the backend.
#[async_trait]
pub trait LockPrimitive: Send + Sync + 'static {
    /// Try to acquire `key` for no longer than `timeout`. `Ok(None)` means the wait timed out. The lock is released
    /// when the returned lease is dropped.
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<Option<LockLease>, StoreError>;
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whoever is authenticated for the current request. The store trusts the value as-is.
pub trait PrincipalProvider: Send + Sync + 'static {
    fn current(&self) -> Option<String>;
}

/// No authenticated principal; per-principal cache lookups are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl PrincipalProvider for Anonymous {
    fn current(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("cache backend failure: {0}")]
pub struct CacheBackendError(pub String);

/// Storage behind the shared and per-principal cache tiers.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CacheBackendError>;
    async fn insert(&self, key: String, value: V, ttl: Duration) -> Result<(), CacheBackendError>;
    async fn remove(&self, key: &str) -> Result<(), CacheBackendError>;
    /// Returns the number of removed entries.
    async fn remove_prefix(&self, prefix: &str) -> Result<u64, CacheBackendError>;
    async fn clear(&self) -> Result<(), CacheBackendError>;
}
