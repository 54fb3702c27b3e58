//! Three-tier cache.
//!
//! | Tier | Lifetime | Shared by |
//! | ---- | -------- | --------- |
//! | [`Tier::Execution`] | one logical request, see [`within_execution`] | the request only |
//! | [`Tier::Shared`] | TTL, size bound with LRU eviction | every principal and request |
//! | [`Tier::Principal`] | TTL, size bound with LRU eviction | requests of one principal |
//!
//! The shared and per-principal tiers sit on top of a [`CacheBackend`]; by default that's a
//! [moka](https://crates.io/crates/moka) cache. Backend failures never reach the caller: they are logged and reported
//! as misses, since the cache is an optimization and the row store remains the source of truth.
//!
//! The cache doesn't know which keys relate to each other. Keeping tiers coherent (removing a key from every tier
//! before a new value is set anywhere) is up to the caller.
//!
//! Every purge and clear bumps the cache [generation](TieredCache::generation). A reader that fetched a value from
//! the row store stores it with [`set_unless_purged`](TieredCache::set_unless_purged), which refuses to write if
//! anything was purged after the fetch began. That keeps a slow read from putting back what a concurrent write has
//! just evicted.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use tracing::debug;
use tracing::warn;

use crate::config::StoreConfig;
use crate::traits::CacheBackend;
use crate::traits::CacheBackendError;

type Memo = RefCell<HashMap<String, Arc<dyn Any + Send + Sync>>>;

tokio::task_local! {
    static EXECUTION_MEMO: Memo;
}

// Namespace separator for per-principal keys. Never appears in an email address.
const PRINCIPAL_SEP: char = '\u{1f}';

/// Run `f` as one logical request: values put into [`Tier::Execution`] while it runs are visible to it only and are
/// dropped when it completes. Outside of such a scope the execution tier never holds anything.
pub async fn within_execution<F: Future>(f: F) -> F::Output {
    EXECUTION_MEMO.scope(RefCell::new(HashMap::new()), f).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier<'a> {
    Execution,
    Shared,
    /// Namespaced by the principal identifier.
    Principal(&'a str),
}

impl Tier<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Shared => "shared",
            Self::Principal(_) => "principal",
        }
    }
}

impl Display for Tier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Principal(p) => write!(f, "principal({p})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub execution_hits: u64,
    pub principal_hits: u64,
    pub shared_hits:    u64,
    pub misses:         u64,
    /// Backend failures turned into misses.
    pub degraded:       u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.execution_hits + self.principal_hits + self.shared_hits
    }

    /// Hit rate in range 0.0..=1.0.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        }
        else {
            self.hits() as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    execution_hits: AtomicU64,
    principal_hits: AtomicU64,
    shared_hits:    AtomicU64,
    misses:         AtomicU64,
    degraded:       AtomicU64,
}

impl Counters {
    fn record(&self, tier: Tier<'_>, hit: bool) {
        let counter = match (tier, hit) {
            (_, false) => &self.misses,
            (Tier::Execution, true) => &self.execution_hits,
            (Tier::Shared, true) => &self.shared_hits,
            (Tier::Principal(_), true) => &self.principal_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            execution_hits: self.execution_hits.load(Ordering::Relaxed),
            principal_hits: self.principal_hits.load(Ordering::Relaxed),
            shared_hits:    self.shared_hits.load(Ordering::Relaxed),
            misses:         self.misses.load(Ordering::Relaxed),
            degraded:       self.degraded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Timed<V> {
    value: V,
    ttl:   Duration,
}

struct PerEntryTtl;

impl<V> Expiry<String, Timed<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Timed<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Timed<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process [`CacheBackend`] over moka with per-entry TTL and LRU eviction.
pub struct MokaBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<String, Timed<V>>,
}

impl<V> MokaBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .name(name)
                .max_capacity(max_capacity)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl<V> CacheBackend<V> for MokaBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CacheBackendError> {
        Ok(self.cache.get(key).await.map(|timed| timed.value))
    }

    async fn insert(&self, key: String, value: V, ttl: Duration) -> Result<(), CacheBackendError> {
        self.cache.insert(key, Timed { value, ttl }).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheBackendError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64, CacheBackendError> {
        let keys = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }
        Ok(keys.len() as u64)
    }

    async fn clear(&self) -> Result<(), CacheBackendError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

pub struct TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    shared:        Arc<dyn CacheBackend<V>>,
    principal:     Arc<dyn CacheBackend<V>>,
    shared_ttl:    Duration,
    principal_ttl: Duration,
    counters:      Counters,
    generation:    AtomicU64,
    // Purges take it exclusively, conditional sets shared.
    fence:         tokio::sync::RwLock<()>,
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Tiers backed by moka, sized and timed after `config`.
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_backends(
            Arc::new(MokaBackend::new("shared", config.shared_capacity())),
            Arc::new(MokaBackend::new("principal", config.principal_capacity())),
            config.shared_ttl(),
            config.principal_ttl(),
        )
    }

    pub fn with_backends(
        shared: Arc<dyn CacheBackend<V>>,
        principal: Arc<dyn CacheBackend<V>>,
        shared_ttl: Duration,
        principal_ttl: Duration,
    ) -> Self {
        Self {
            shared,
            principal,
            shared_ttl,
            principal_ttl,
            counters: Counters::default(),
            generation: AtomicU64::new(0),
            fence: tokio::sync::RwLock::new(()),
        }
    }

    pub async fn get(&self, tier: Tier<'_>, key: &str) -> Option<V> {
        let found = match tier {
            Tier::Execution => Self::memo_get(key),
            Tier::Shared => {
                let result = self.shared.get(key).await;
                self.degrade(tier, "get", result).flatten()
            }
            Tier::Principal(principal) => {
                let result = self.principal.get(&principal_key(principal, key)).await;
                self.degrade(tier, "get", result).flatten()
            }
        };
        debug!(%tier, key, hit = found.is_some(), "cache lookup");
        self.counters.record(tier, found.is_some());
        found
    }

    /// Store `value` under `key`. `ttl` defaults to the tier's TTL and is ignored by the execution tier.
    pub async fn set(&self, tier: Tier<'_>, key: &str, value: V, ttl: Option<Duration>) {
        match tier {
            Tier::Execution => Self::memo_set(key, value),
            Tier::Shared => {
                let result = self
                    .shared
                    .insert(key.to_string(), value, ttl.unwrap_or(self.shared_ttl))
                    .await;
                self.degrade(tier, "set", result);
            }
            Tier::Principal(principal) => {
                let result = self
                    .principal
                    .insert(principal_key(principal, key), value, ttl.unwrap_or(self.principal_ttl))
                    .await;
                self.degrade(tier, "set", result);
            }
        }
    }

    pub async fn remove(&self, tier: Tier<'_>, key: &str) {
        match tier {
            Tier::Execution => {
                let _ = EXECUTION_MEMO.try_with(|memo| memo.borrow_mut().remove(key));
            }
            Tier::Shared => {
                let result = self.shared.remove(key).await;
                self.degrade(tier, "remove", result);
            }
            Tier::Principal(principal) => {
                let result = self.principal.remove(&principal_key(principal, key)).await;
                self.degrade(tier, "remove", result);
            }
        }
    }

    /// Remove every key of the tier starting with `prefix`. Returns how many were removed, as far as the backend
    /// knows.
    pub async fn invalidate_pattern(&self, tier: Tier<'_>, prefix: &str) -> u64 {
        match tier {
            Tier::Execution => EXECUTION_MEMO
                .try_with(|memo| {
                    let mut memo = memo.borrow_mut();
                    let before = memo.len();
                    memo.retain(|key, _| !key.starts_with(prefix));
                    (before - memo.len()) as u64
                })
                .unwrap_or(0),
            Tier::Shared => {
                let result = self.shared.remove_prefix(prefix).await;
                self.degrade(tier, "invalidate_pattern", result).unwrap_or(0)
            }
            Tier::Principal(principal) => {
                let result = self.principal.remove_prefix(&principal_key(principal, prefix)).await;
                self.degrade(tier, "invalidate_pattern", result).unwrap_or(0)
            }
        }
    }

    /// Current generation. Take it before fetching a value that is going to be stored with
    /// [`set_unless_purged`](Self::set_unless_purged).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store `entries` with the tiers' default TTLs unless a purge or clear happened since `generation` was taken.
    /// Returns `false` if nothing was stored.
    pub async fn set_unless_purged<'t, I>(&self, generation: u64, entries: I) -> bool
    where
        I: IntoIterator<Item = (Tier<'t>, String, V)>,
    {
        let _fence = self.fence.read().await;
        if self.generation() != generation {
            debug!(generation, current = self.generation(), "purged since fetch, not caching");
            return false;
        }
        for (tier, key, value) in entries {
            self.set(tier, &key, value, None).await;
        }
        true
    }

    /// Remove `key` from every tier that may hold it.
    pub async fn purge(&self, principal: Option<&str>, key: &str) {
        let _fence = self.begin_purge().await;
        self.remove(Tier::Execution, key).await;
        self.remove(Tier::Shared, key).await;
        if let Some(principal) = principal {
            self.remove(Tier::Principal(principal), key).await;
        }
    }

    /// Pattern invalidation over every tier that may hold matching keys.
    pub async fn purge_pattern(&self, principal: Option<&str>, prefix: &str) -> u64 {
        let _fence = self.begin_purge().await;
        let mut removed = self.invalidate_pattern(Tier::Execution, prefix).await;
        removed += self.invalidate_pattern(Tier::Shared, prefix).await;
        if let Some(principal) = principal {
            removed += self.invalidate_pattern(Tier::Principal(principal), prefix).await;
        }
        removed
    }

    /// Drop everything. Meant for process bootstrap and tests.
    pub async fn clear(&self) {
        let _fence = self.begin_purge().await;
        let _ = EXECUTION_MEMO.try_with(|memo| memo.borrow_mut().clear());
        let result = self.shared.clear().await;
        self.degrade(Tier::Shared, "clear", result);
        let result = self.principal.clear().await;
        self.degrade(Tier::Principal(""), "clear", result);
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    async fn begin_purge(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        let fence = self.fence.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        fence
    }

    fn memo_get(key: &str) -> Option<V> {
        EXECUTION_MEMO
            .try_with(|memo| memo.borrow().get(key).and_then(|v| v.downcast_ref::<V>().cloned()))
            .ok()
            .flatten()
    }

    fn memo_set(key: &str, value: V) {
        let _ = EXECUTION_MEMO.try_with(|memo| {
            memo.borrow_mut()
                .insert(key.to_string(), Arc::new(value) as Arc<dyn Any + Send + Sync>)
        });
    }

    fn degrade<T>(&self, tier: Tier<'_>, op: &'static str, result: Result<T, CacheBackendError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(err) => {
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(tier = tier.name(), op, error = %err, "cache backend failure, treating as a miss");
                None
            }
        }
    }
}

fn principal_key(principal: &str, key: &str) -> String {
    format!("{principal}{PRINCIPAL_SEP}{key}")
}
