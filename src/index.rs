//! Row index of the tenant table.
//!
//! The backend can't look rows up by value, so a lookup by tenant id or principal email needs to know the row offset
//! first. [`IndexBuilder`] reads the whole table in one call, folds it into a pair of key → offset maps and keeps
//! the result as an immutable [`IndexSnapshot`] until it gets stale.
//!
//! A snapshot goes stale after an explicit [`invalidate`](IndexBuilder::invalidate) or when it is older than the
//! configured maximum age. The next [`get_index`](IndexBuilder::get_index) rebuilds it; concurrent callers wait for
//! the same rebuild instead of starting their own.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::client::RowStoreClient;
use crate::codec;
use crate::codec::TENANT_COLUMNS;
use crate::error::Result;
use crate::traits::Clock;
use crate::traits::RowBackend;
use crate::types::normalize_email;
use crate::types::KeyField;
use crate::types::RangeSpec;
use crate::types::Row;
use crate::types::RowOffset;

/// A key seen on more than one row. The first row keeps the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    pub key:              String,
    pub first_offset:     RowOffset,
    pub duplicate_offset: RowOffset,
}

#[derive(Debug, Clone, Default)]
struct KeyIndex {
    offsets:    HashMap<String, RowOffset>,
    duplicates: Vec<DuplicateKey>,
}

impl KeyIndex {
    fn insert(&mut self, key: String, offset: RowOffset) -> Option<&DuplicateKey> {
        match self.offsets.get(&key) {
            Some(&first_offset) => {
                self.duplicates.push(DuplicateKey {
                    key,
                    first_offset,
                    duplicate_offset: offset,
                });
                self.duplicates.last()
            }
            None => {
                self.offsets.insert(key, offset);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    by_id:          KeyIndex,
    by_email:       KeyIndex,
    row_count:      usize,
    built_at:       DateTime<Utc>,
    built:          Instant,
    possibly_stale: Option<String>,
}

impl IndexSnapshot {
    fn fold(table: &str, rows: &[Row], built_at: DateTime<Utc>) -> Self {
        let mut snapshot = Self {
            by_id: KeyIndex::default(),
            by_email: KeyIndex::default(),
            row_count: rows.len(),
            built_at,
            built: Instant::now(),
            possibly_stale: None,
        };

        for (offset, row) in rows.iter().enumerate() {
            if codec::is_blank(row) {
                continue;
            }

            let id = codec::cell(row, codec::COL_ID).trim();
            if id.is_empty() {
                warn!(table, offset, "row without id is not indexed");
            }
            else if let Some(dup) = snapshot.by_id.insert(id.to_string(), offset) {
                warn!(
                    table,
                    key = %dup.key,
                    first = dup.first_offset,
                    duplicate = dup.duplicate_offset,
                    "duplicate tenant id"
                );
            }

            match normalize_email(codec::cell(row, codec::COL_EMAIL)) {
                Ok(email) => {
                    if let Some(dup) = snapshot.by_email.insert(email, offset) {
                        warn!(
                            table,
                            key = %dup.key,
                            first = dup.first_offset,
                            duplicate = dup.duplicate_offset,
                            "duplicate principal email"
                        );
                    }
                }
                Err(err) => {
                    warn!(table, offset, error = %err, "row with invalid principal email is not indexed by email")
                }
            }
        }

        snapshot
    }

    fn key_index(&self, field: KeyField) -> &KeyIndex {
        match field {
            KeyField::Id => &self.by_id,
            KeyField::PrincipalEmail => &self.by_email,
        }
    }

    /// Row offset of the record holding `key`. Emails are matched in their normalized form.
    pub fn lookup(&self, field: KeyField, key: &str) -> Option<RowOffset> {
        let index = self.key_index(field);
        match field {
            KeyField::Id => index.offsets.get(key.trim()).copied(),
            KeyField::PrincipalEmail => normalize_email(key)
                .ok()
                .and_then(|email| index.offsets.get(&email).copied()),
        }
    }

    pub fn duplicates(&self, field: KeyField) -> &[DuplicateKey] {
        &self.key_index(field).duplicates
    }

    /// Number of indexed keys of `field`.
    pub fn len(&self, field: KeyField) -> usize {
        self.key_index(field).offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.offsets.is_empty()
    }

    /// Data rows read, blank ones included.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Clock time taken right before the table was read.
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Set when a rebuild failed and this older snapshot was kept in service.
    pub fn is_possibly_stale(&self) -> bool {
        self.possibly_stale.is_some()
    }

    pub fn stale_reason(&self) -> Option<&str> {
        self.possibly_stale.as_deref()
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        self.built.elapsed() >= max_age
    }

    fn flagged_stale(&self, reason: String) -> Self {
        Self {
            possibly_stale: Some(reason),
            ..self.clone()
        }
    }
}

enum Rebuild {
    /// Only if the current snapshot is not fresh.
    IfStale,
    /// Unless somebody has replaced this snapshot already.
    Replacing(Arc<IndexSnapshot>),
    /// Unconditionally, and without falling back to the previous snapshot on failure.
    Forced,
}

pub struct IndexBuilder<B>
where
    B: RowBackend,
{
    client:      Arc<RowStoreClient<B>>,
    clock:       Arc<dyn Clock>,
    table:       String,
    max_age:     Duration,
    current:     RwLock<Option<Arc<IndexSnapshot>>>,
    invalidated: AtomicBool,
    rebuilding:  tokio::sync::Mutex<()>,
    builds:      AtomicU64,
}

impl<B> IndexBuilder<B>
where
    B: RowBackend,
{
    pub fn new<S: Into<String>>(
        client: Arc<RowStoreClient<B>>,
        clock: Arc<dyn Clock>,
        table: S,
        max_age: Duration,
    ) -> Self {
        Self {
            client,
            clock,
            table: table.into(),
            max_age,
            current: RwLock::new(None),
            invalidated: AtomicBool::new(false),
            rebuilding: tokio::sync::Mutex::new(()),
            builds: AtomicU64::new(0),
        }
    }

    /// Current snapshot, rebuilt first if stale.
    pub async fn get_index(&self) -> Result<Arc<IndexSnapshot>> {
        match self.fresh() {
            Some(snapshot) => Ok(snapshot),
            None => self.rebuild(Rebuild::IfStale).await,
        }
    }

    /// Rebuild now. A failure is returned as is; the previous snapshot is not offered in place of a fresh one.
    pub async fn refresh(&self) -> Result<Arc<IndexSnapshot>> {
        self.rebuild(Rebuild::Forced).await
    }

    /// Rebuild if the backend reports the table was modified at or after the current snapshot was taken. Backends that
    /// don't track modification times never trigger a rebuild here.
    pub async fn refresh_if_modified(&self) -> Result<Arc<IndexSnapshot>> {
        let snapshot = self.get_index().await?;
        match self.client.modified_at(&self.table).await {
            Ok(Some(modified)) if modified >= snapshot.built_at() => {
                debug!(
                    table = %self.table,
                    %modified,
                    built_at = %snapshot.built_at(),
                    "table modified since index build"
                );
                self.rebuild(Rebuild::Replacing(snapshot)).await
            }
            Ok(_) => Ok(snapshot),
            Err(err) => {
                warn!(table = %self.table, error = %err, "cannot fetch table modification time");
                Ok(snapshot)
            }
        }
    }

    /// Mark the current snapshot stale; the next [`get_index`](Self::get_index) rebuilds.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// How many times the index has been built.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn fresh(&self) -> Option<Arc<IndexSnapshot>> {
        if self.invalidated.load(Ordering::Acquire) {
            return None;
        }
        self.current
            .read()
            .as_ref()
            .filter(|s| !s.is_possibly_stale() && !s.is_expired(self.max_age))
            .cloned()
    }

    #[instrument(level = "debug", skip(self, mode), fields(table = %self.table))]
    async fn rebuild(&self, mode: Rebuild) -> Result<Arc<IndexSnapshot>> {
        let _guard = self.rebuilding.lock().await;

        // Whoever held the guard before us may have done the job already.
        match &mode {
            Rebuild::IfStale => {
                if let Some(snapshot) = self.fresh() {
                    return Ok(snapshot);
                }
            }
            Rebuild::Replacing(old) => {
                if let Some(snapshot) = self.fresh().filter(|s| !Arc::ptr_eq(s, old)) {
                    return Ok(snapshot);
                }
            }
            Rebuild::Forced => (),
        }

        // Cleared before reading so an invalidation arriving during the read survives it.
        let was_invalidated = self.invalidated.swap(false, Ordering::AcqRel);
        let built_at = self.clock.now();
        let range = RangeSpec::data_rows(&self.table, TENANT_COLUMNS.len());

        match self.client.read_range(&range).await {
            Ok(rows) => {
                let snapshot = Arc::new(IndexSnapshot::fold(&self.table, &rows, built_at));
                self.builds.fetch_add(1, Ordering::Relaxed);
                debug!(
                    rows = snapshot.row_count(),
                    ids = snapshot.len(KeyField::Id),
                    emails = snapshot.len(KeyField::PrincipalEmail),
                    "index rebuilt"
                );
                *self.current.write() = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(err) => {
                if was_invalidated {
                    self.invalidated.store(true, Ordering::Release);
                }
                let previous = self.current.read().clone();
                match (previous, mode) {
                    (Some(previous), Rebuild::IfStale | Rebuild::Replacing(_)) => {
                        warn!(error = %err, "index rebuild failed, serving previous snapshot as possibly stale");
                        let stale = Arc::new(previous.flagged_stale(err.to_string()));
                        *self.current.write() = Some(Arc::clone(&stale));
                        Ok(stale)
                    }
                    _ => Err(err),
                }
            }
        }
    }
}
