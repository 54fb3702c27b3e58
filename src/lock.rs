//! Lock-guarded writer.
//!
//! Every read-modify-write of a remote row runs inside [`LockGuardedWriter::with_lock`]. The lock itself comes from a
//! [`LockPrimitive`]; [`LocalLocks`] is the in-process implementation used when all writers share one process.
//!
//! Locks are not reentrant. A call stack that already holds a key and asks for it again gets
//! [`StoreError::LockReentrancy`] immediately instead of deadlocking on itself.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::instrument;

use crate::error::Result;
use crate::error::StoreError;
use crate::traits::LockPrimitive;

tokio::task_local! {
    static HELD_LOCKS: RefCell<Vec<String>>;
}

/// What a single lock key protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum LockScope {
    /// One key for the whole tenant table.
    Table,
    /// One key per tenant record. Structural changes (create, delete) still take the table key.
    Record,
}

impl Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Table => "table",
            Self::Record => "record",
        })
    }
}

/// Proof of lock ownership. Dropping it releases the lock.
pub struct LockLease {
    key:    String,
    _guard: Box<dyn Send + Sync>,
}

impl LockLease {
    pub fn new<S, G>(key: S, guard: G) -> Self
    where
        S: Into<String>,
        G: Send + Sync + 'static,
    {
        Self {
            key:    key.into(),
            _guard: Box::new(guard),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease").field("key", &self.key).finish()
    }
}

/// Keyed tokio mutexes living in this process.
#[derive(Debug, Default)]
pub struct LocalLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Drop entries nobody holds or waits for so the map doesn't grow with every tenant ever touched.
        locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[async_trait]
impl LockPrimitive for LocalLocks {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<Option<LockLease>> {
        let mutex = self.lock_for(key);
        Ok(tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .ok()
            .map(|guard| LockLease::new(key, guard)))
    }
}

#[derive(Debug)]
pub struct LockGuardedWriter<L>
where
    L: LockPrimitive,
{
    locks: Arc<L>,
}

impl<L> LockGuardedWriter<L>
where
    L: LockPrimitive,
{
    pub fn new(locks: Arc<L>) -> Self {
        Self { locks }
    }

    /// True if the current call stack holds `key`.
    pub fn holds(&self, key: &str) -> bool {
        HELD_LOCKS
            .try_with(|held| held.borrow().iter().any(|k| k == key))
            .unwrap_or(false)
    }

    /// Run `f` while holding `key`.
    ///
    /// Fails with [`StoreError::LockTimeout`] without running `f` if the lock isn't acquired within `timeout`. The
    /// lock is released once `f` completes, whatever its outcome.
    #[instrument(level = "debug", skip(self, f))]
    pub async fn with_lock<T, F, Fut>(&self, key: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.holds(key) {
            return Err(StoreError::LockReentrancy { key: key.to_string() });
        }

        let started = Instant::now();
        let Some(lease) = self.locks.acquire(key, timeout).await?
        else {
            return Err(StoreError::LockTimeout {
                key:    key.to_string(),
                waited: started.elapsed(),
            });
        };
        debug!(key, waited = ?started.elapsed(), "lock acquired");

        let outcome = if HELD_LOCKS.try_with(|_| ()).is_ok() {
            HELD_LOCKS.with(|held| held.borrow_mut().push(key.to_string()));
            let _held = HeldKey(key);
            f().await
        }
        else {
            HELD_LOCKS.scope(RefCell::new(vec![key.to_string()]), f()).await
        };

        drop(lease);
        debug!(key, "lock released");
        outcome
    }
}

// Forgets a nested key when its section ends, including by panic or cancellation.
struct HeldKey<'a>(&'a str);

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        let _ = HELD_LOCKS.try_with(|held| held.borrow_mut().retain(|k| k != self.0));
    }
}
