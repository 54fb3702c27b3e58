//! Tenant record repository.
//!
//! The only part of the crate application code is expected to talk to. Reads go through the cache tiers (execution,
//! then the current principal's, then shared), fall back to the index and a single-row fetch, and populate every
//! tier on the way back, unless the tenant was evicted while the row was being read. Writes run under the
//! lock-guarded writer, re-read the row bypassing the caches, and evict cached copies before anything is written and
//! again after the backend confirmed the write; only then are the caches repopulated.
//!
//! Cache layout:
//!
//! | Key | Value |
//! | --- | ----- |
//! | `tenant:{id}:record` | the record |
//! | `principal:{email}` | alias to the record id |
//!
//! Everything cached about a tenant lives under the `tenant:{id}:` prefix so a delete can evict it with one pattern
//! invalidation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::cache::Tier;
use crate::cache::TieredCache;
use crate::client::RowStoreClient;
use crate::codec;
use crate::codec::TENANT_COLUMNS;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::error::StoreError;
use crate::index::DuplicateKey;
use crate::index::IndexBuilder;
use crate::index::IndexSnapshot;
use crate::lock::LocalLocks;
use crate::lock::LockGuardedWriter;
use crate::lock::LockScope;
use crate::traits::Anonymous;
use crate::traits::Clock;
use crate::traits::LockPrimitive;
use crate::traits::PrincipalProvider;
use crate::traits::RowBackend;
use crate::traits::SystemClock;
use crate::types::normalize_email;
use crate::types::AuditEntry;
use crate::types::AuditStatus;
use crate::types::ConfigBlob;
use crate::types::DeleteAck;
use crate::types::KeyField;
use crate::types::RangeSpec;
use crate::types::RowOffset;
use crate::types::TenantRecord;

/// What the repository keeps in the cache tiers.
#[derive(Debug, Clone)]
pub enum CachedTenant {
    Record(Arc<TenantRecord>),
    /// Secondary key entry pointing at the record id.
    Alias(String),
}

/// Duplicate-key diagnostics of the tenant table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub rows:             usize,
    pub id_duplicates:    Vec<DuplicateKey>,
    pub email_duplicates: Vec<DuplicateKey>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.id_duplicates.is_empty() && self.email_duplicates.is_empty()
    }
}

pub fn record_key(id: &str) -> String {
    format!("tenant:{id}:record")
}

pub fn alias_key(email: &str) -> String {
    format!("principal:{email}")
}

fn tenant_prefix(id: &str) -> String {
    format!("tenant:{id}:")
}

pub struct TenantRepository<B, L = LocalLocks>
where
    B: RowBackend,
    L: LockPrimitive,
{
    client:    Arc<RowStoreClient<B>>,
    index:     IndexBuilder<B>,
    audit:     AuditLog<B>,
    cache:     Arc<TieredCache<CachedTenant>>,
    writer:    LockGuardedWriter<L>,
    clock:     Arc<dyn Clock>,
    principal: Arc<dyn PrincipalProvider>,
    config:    StoreConfig,
}

impl<B> TenantRepository<B, LocalLocks>
where
    B: RowBackend,
{
    /// Repository with in-process locks, the system clock, no principal and a fresh cache.
    pub async fn open(backend: Arc<B>, config: StoreConfig) -> Result<Self> {
        let cache = Arc::new(TieredCache::new(&config));
        Self::open_with(
            backend,
            Arc::new(LocalLocks::new()),
            cache,
            Arc::new(SystemClock),
            Arc::new(Anonymous),
            config,
        )
        .await
    }
}

impl<B, L> TenantRepository<B, L>
where
    B: RowBackend,
    L: LockPrimitive,
{
    /// Wire the repository to its collaborators and verify both table headers.
    pub async fn open_with(
        backend: Arc<B>,
        locks: Arc<L>,
        cache: Arc<TieredCache<CachedTenant>>,
        clock: Arc<dyn Clock>,
        principal: Arc<dyn PrincipalProvider>,
        config: StoreConfig,
    ) -> Result<Self> {
        let client = Arc::new(RowStoreClient::new(backend, &config));
        let index = IndexBuilder::new(
            Arc::clone(&client),
            Arc::clone(&clock),
            config.tenant_table(),
            config.index_max_age(),
        );
        let audit = AuditLog::new(Arc::clone(&client), config.audit_table());

        client
            .verify_header(&config.tenant_table(), &TENANT_COLUMNS)
            .await?;
        audit.verify_header().await?;

        Ok(Self {
            client,
            index,
            audit,
            cache,
            writer: LockGuardedWriter::new(locks),
            clock,
            principal,
            config,
        })
    }

    pub fn cache(&self) -> &Arc<TieredCache<CachedTenant>> {
        &self.cache
    }

    pub fn index(&self) -> &IndexBuilder<B> {
        &self.index
    }

    pub fn audit(&self) -> &AuditLog<B> {
        &self.audit
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Active tenant registered for `email`. Nobody is registered under a string that isn't an email address.
    #[instrument(level = "debug", skip(self))]
    pub async fn find_by_principal(&self, email: &str) -> Result<Option<TenantRecord>> {
        let email = match normalize_email(email) {
            Ok(email) => email,
            Err(err) => {
                debug!(error = %err, "not an email address");
                return Ok(None);
            }
        };
        Ok(self
            .lookup(KeyField::PrincipalEmail, &email)
            .await?
            .filter(|record| record.active))
    }

    /// Active tenant with `id`.
    #[instrument(level = "debug", skip(self))]
    pub async fn find_by_id(&self, id: &str) -> Result<Option<TenantRecord>> {
        Ok(self.lookup(KeyField::Id, id.trim()).await?.filter(|record| record.active))
    }

    /// Tenant with `id`, whether active or not.
    #[instrument(level = "debug", skip(self))]
    pub async fn find_any_by_id(&self, id: &str) -> Result<Option<TenantRecord>> {
        self.lookup(KeyField::Id, id.trim()).await
    }

    /// Register a new tenant for `principal_email` with an empty configuration.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_tenant(&self, principal_email: &str) -> Result<TenantRecord> {
        let email = normalize_email(principal_email)?;
        let record = TenantRecord::new(Uuid::now_v7().to_string(), email, self.clock.now());
        self.create(record).await
    }

    /// Store a new record. Fails with [`StoreError::DuplicateKey`] if its id or email is taken by any record, active or
    /// not.
    #[instrument(level = "debug", skip(self, record), fields(id = %record.id))]
    pub async fn create(&self, mut record: TenantRecord) -> Result<TenantRecord> {
        record.id = record.id.trim().to_string();
        record.principal_email = normalize_email(&record.principal_email)?;
        record.validate()?;

        let id = record.id.clone();
        self.locked(&id, true, || self.create_locked(record)).await
    }

    /// Apply `mutator` to the configuration of an active tenant.
    #[instrument(level = "debug", skip(self, mutator))]
    pub async fn update_config<F>(&self, id: &str, mutator: F) -> Result<TenantRecord>
    where
        F: FnOnce(ConfigBlob) -> Result<ConfigBlob> + Send,
    {
        let now = self.clock.now();
        self.update(id, true, move |mut record| {
            record.config_blob = mutator(record.config_blob)?;
            record.config_blob.updated_at = Some(now);
            Ok(record)
        })
        .await
    }

    /// Activate or deactivate a tenant. Inactive tenants are invisible to the `find_by_*` lookups but keep their keys.
    #[instrument(level = "debug", skip(self))]
    pub async fn set_active(&self, id: &str, active: bool) -> Result<TenantRecord> {
        self.update(id, false, move |mut record| {
            record.active = active;
            Ok(record)
        })
        .await
    }

    /// Remove a tenant and leave a trace of it in the audit log.
    ///
    /// The removal stands even if the audit entry can't be appended; [`DeleteAck::audit`] tells whether it was.
    #[instrument(level = "debug", skip(self, reason))]
    pub async fn delete_tenant(&self, id: &str, actor_principal: &str, reason: &str) -> Result<DeleteAck> {
        let id = id.trim();
        if actor_principal.trim().is_empty() {
            return Err(StoreError::validation("actor principal is required"));
        }
        self.locked(id, true, || self.delete_locked(id, actor_principal, reason))
            .await
    }

    /// Every decodable record passing `filter`, read with a single call. Nothing is cached.
    #[instrument(level = "debug", skip(self, filter))]
    pub async fn list_all<F>(&self, filter: F) -> Result<Vec<TenantRecord>>
    where
        F: Fn(&TenantRecord) -> bool,
    {
        let table = self.config.tenant_table();
        let rows = self
            .client
            .read_range(&RangeSpec::data_rows(&table, TENANT_COLUMNS.len()))
            .await?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (offset, row) in rows.iter().enumerate() {
            if codec::is_blank(row) {
                continue;
            }
            match codec::decode_tenant(&table, offset, row) {
                // Same rule as the index: the first row holding an id wins.
                Ok(record) if seen.insert(record.id.clone()) => {
                    if filter(&record) {
                        records.push(record);
                    }
                }
                Ok(record) => debug!(offset, id = %record.id, "skipping duplicate row"),
                Err(err) => warn!(offset, error = %err, "skipping corrupt row"),
            }
        }
        Ok(records)
    }

    pub async fn list_active_tenants(&self) -> Result<Vec<TenantRecord>> {
        self.list_all(|record| record.active).await
    }

    /// Duplicate keys found in the tenant table by a fresh scan.
    pub async fn integrity_report(&self) -> Result<IntegrityReport> {
        let index = self.index.refresh().await?;
        Ok(IntegrityReport {
            rows:             index.row_count(),
            id_duplicates:    index.duplicates(KeyField::Id).to_vec(),
            email_duplicates: index.duplicates(KeyField::PrincipalEmail).to_vec(),
        })
    }

    /// Drop every cached record and force an index rebuild on the next lookup.
    pub async fn clear_caches(&self) {
        self.cache.clear().await;
        self.index.invalidate();
    }

    async fn lookup(&self, field: KeyField, key: &str) -> Result<Option<TenantRecord>> {
        let principal = self.principal.current();
        if let Some(record) = self.cached(principal.as_deref(), field, key).await {
            return Ok(Some(record));
        }

        // Taken before the row is read. A write evicting this tenant meanwhile wins over what we fetched.
        let generation = self.cache.generation();
        match self.fetch(field, key).await? {
            Some((_, record)) => {
                self.cache
                    .set_unless_purged(generation, Self::cache_entries(&record))
                    .await;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn cached(&self, principal: Option<&str>, field: KeyField, key: &str) -> Option<TenantRecord> {
        let id = match field {
            KeyField::Id => key.to_string(),
            KeyField::PrincipalEmail => match self.cached_entry(principal, &alias_key(key)).await? {
                CachedTenant::Alias(id) => id,
                CachedTenant::Record(_) => return None,
            },
        };

        match self.cached_entry(principal, &record_key(&id)).await? {
            // An alias may outlive a record that changed hands; only trust it if the record agrees.
            CachedTenant::Record(record) if record.key(field) == key => Some(record.as_ref().clone()),
            _ => None,
        }
    }

    async fn cached_entry(&self, principal: Option<&str>, key: &str) -> Option<CachedTenant> {
        if let Some(entry) = self.cache.get(Tier::Execution, key).await {
            return Some(entry);
        }

        let mut found = None;
        if let Some(principal) = principal {
            found = self.cache.get(Tier::Principal(principal), key).await;
        }
        if found.is_none() {
            found = self.cache.get(Tier::Shared, key).await;
        }

        if let Some(entry) = &found {
            self.cache.set(Tier::Execution, key, entry.clone(), None).await;
        }
        found
    }

    /// Index lookup and single-row fetch. A row that no longer holds the key means the index is behind the table;
    /// it's rebuilt and the lookup retried once.
    async fn fetch(&self, field: KeyField, key: &str) -> Result<Option<(RowOffset, TenantRecord)>> {
        let mut index = self.read_index().await?;
        let mut retried = false;

        loop {
            let offset = match index.lookup(field, key) {
                Some(offset) => offset,
                None if !retried => {
                    retried = true;
                    index = Self::accept_for_read(&self.config, self.index.refresh_if_modified().await?)?;
                    continue;
                }
                None => return Ok(None),
            };

            match self.read_record(offset).await? {
                Some(record) if record.key(field) == key => return Ok(Some((offset, record))),
                _ if !retried => {
                    debug!(%field, key, offset, "indexed row doesn't hold the key, rebuilding index");
                    retried = true;
                    self.index.invalidate();
                    index = self.read_index().await?;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn read_index(&self) -> Result<Arc<IndexSnapshot>> {
        Self::accept_for_read(&self.config, self.index.get_index().await?)
    }

    fn accept_for_read(config: &StoreConfig, index: Arc<IndexSnapshot>) -> Result<Arc<IndexSnapshot>> {
        match index.stale_reason() {
            Some(reason) if !config.allow_stale_index_reads() => Err(StoreError::Transient {
                operation: "index_rebuild",
                attempts:  1,
                message:   reason.to_string(),
            }),
            Some(reason) => {
                warn!(reason, "serving read from a possibly stale index");
                Ok(index)
            }
            None => Ok(index),
        }
    }

    async fn read_record(&self, offset: RowOffset) -> Result<Option<TenantRecord>> {
        let table = self.config.tenant_table();
        match self.client.read_row(&table, offset, TENANT_COLUMNS.len()).await? {
            Some(row) if !codec::is_blank(&row) => codec::decode_tenant(&table, offset, &row).map(Some),
            _ => Ok(None),
        }
    }

    /// Current row of `id` straight from the backend, using an index that is never possibly stale.
    async fn read_fresh(&self, id: &str) -> Result<Option<(RowOffset, TenantRecord)>> {
        let mut index = self.index.get_index().await?;
        if index.is_possibly_stale() {
            index = self.index.refresh().await?;
        }

        for attempt in 0..2 {
            if let Some(offset) = index.lookup(KeyField::Id, id) {
                if let Some(record) = self.read_record(offset).await? {
                    if record.id == id {
                        return Ok(Some((offset, record)));
                    }
                }
            }
            if attempt == 0 {
                index = self.index.refresh().await?;
            }
        }
        Ok(None)
    }

    async fn populate(&self, record: &TenantRecord) {
        for (tier, key, value) in Self::cache_entries(record) {
            self.cache.set(tier, &key, value, None).await;
        }
    }

    /// Every tier gets the record and the alias, the per-principal tier under the owner's namespace.
    fn cache_entries(record: &TenantRecord) -> Vec<(Tier<'_>, String, CachedTenant)> {
        let shared = Arc::new(record.clone());
        let rkey = record_key(&record.id);
        let akey = alias_key(&record.principal_email);

        [
            Tier::Execution,
            Tier::Principal(&record.principal_email),
            Tier::Shared,
        ]
        .into_iter()
        .flat_map(|tier| {
            [
                (tier, rkey.clone(), CachedTenant::Record(Arc::clone(&shared))),
                (tier, akey.clone(), CachedTenant::Alias(record.id.clone())),
            ]
        })
        .collect()
    }

    async fn evict(&self, id: &str, email: &str) {
        let removed = self.cache.purge_pattern(Some(email), &tenant_prefix(id)).await;
        self.cache.purge(Some(email), &alias_key(email)).await;
        debug!(id, removed, "evicted cached tenant");
    }

    fn table_lock_key(&self) -> String {
        format!("lock:{}", self.config.tenant_table())
    }

    fn record_lock_key(&self, id: &str) -> String {
        format!("lock:{}:{id}", self.config.tenant_table())
    }

    /// Run `f` under the locks a write to `id` needs. Structural writes (create, delete) always hold the table key.
    async fn locked<T, F, Fut>(&self, id: &str, structural: bool, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.lock_timeout();
        match (self.config.lock_scope(), structural) {
            (LockScope::Table, _) => self.writer.with_lock(&self.table_lock_key(), timeout, f).await,
            (LockScope::Record, false) => {
                self.writer
                    .with_lock(&self.record_lock_key(id), timeout, f)
                    .await
            }
            (LockScope::Record, true) => {
                let record_lock = self.record_lock_key(id);
                self.writer
                    .with_lock(&self.table_lock_key(), timeout, || {
                        self.writer.with_lock(&record_lock, timeout, f)
                    })
                    .await
            }
        }
    }

    async fn create_locked(&self, record: TenantRecord) -> Result<TenantRecord> {
        let index = self.index.refresh().await?;
        for field in [KeyField::Id, KeyField::PrincipalEmail] {
            if index.lookup(field, record.key(field)).is_some() {
                return Err(StoreError::DuplicateKey {
                    field,
                    key: record.key(field).to_string(),
                });
            }
        }

        let row = codec::encode_tenant(&record)?;
        self.evict(&record.id, &record.principal_email).await;
        let offset = self
            .client
            .append_row(&self.config.tenant_table(), row)
            .await?;
        self.index.invalidate();
        debug!(id = %record.id, offset, "tenant created");

        self.populate(&record).await;
        Ok(record)
    }

    async fn update<F>(&self, id: &str, active_only: bool, mutator: F) -> Result<TenantRecord>
    where
        F: FnOnce(TenantRecord) -> Result<TenantRecord> + Send,
    {
        let id = id.trim();
        self.locked(id, false, || self.update_locked(id, active_only, mutator))
            .await
    }

    async fn update_locked<F>(&self, id: &str, active_only: bool, mutator: F) -> Result<TenantRecord>
    where
        F: FnOnce(TenantRecord) -> Result<TenantRecord> + Send,
    {
        let (offset, current) = match self.read_fresh(id).await? {
            Some((_, record)) if active_only && !record.active => return Err(StoreError::NotFound(id.to_string())),
            Some(found) => found,
            None => return Err(StoreError::NotFound(id.to_string())),
        };

        let mut updated = mutator(current.clone())?;
        if updated.id != current.id || updated.principal_email != current.principal_email {
            return Err(StoreError::validation("id and principalEmail can't be changed"));
        }
        updated.last_modified = self.clock.now().max(current.last_modified);
        updated.validate()?;
        let row = codec::encode_tenant(&updated)?;

        self.evict(&current.id, &current.principal_email).await;
        self.client
            .write_row(&self.config.tenant_table(), offset, row)
            .await?;
        debug!(id, offset, "tenant updated");

        // Once more, so reads that fetched the old row before the write don't cache it.
        self.evict(&current.id, &current.principal_email).await;
        self.populate(&updated).await;
        Ok(updated)
    }

    async fn delete_locked(&self, id: &str, actor_principal: &str, reason: &str) -> Result<DeleteAck> {
        let (offset, record) = self
            .read_fresh(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.evict(&record.id, &record.principal_email).await;
        self.client
            .clear_row(&self.config.tenant_table(), offset, TENANT_COLUMNS.len())
            .await?;
        self.index.invalidate();
        self.evict(&record.id, &record.principal_email).await;
        debug!(id, offset, "tenant row cleared");

        let entry = AuditEntry {
            timestamp:              self.clock.now(),
            actor_principal:        actor_principal.trim().to_string(),
            target_record_id:       record.id.clone(),
            target_principal_email: record.principal_email.clone(),
            reason:                 reason.to_string(),
        };
        let audit = match self.audit.record(&entry).await {
            Ok(_) => AuditStatus::Recorded,
            Err(err) => {
                warn!(
                    audit_incomplete = true,
                    id = %record.id,
                    actor = %entry.actor_principal,
                    error = %err,
                    "audit_incomplete: tenant deleted but the audit entry was not recorded"
                );
                AuditStatus::Incomplete
            }
        };

        Ok(DeleteAck {
            record_id: record.id,
            principal_email: record.principal_email,
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::within_execution;
    use crate::error::BackendError;
    use crate::test::ManualClock;
    use crate::test::MemoryBackend;
    use crate::test::Op;
    use crate::test::StaticPrincipal;

    struct Fixture {
        clock:     Arc<ManualClock>,
        backend:   Arc<MemoryBackend>,
        principal: Arc<StaticPrincipal>,
        repo:      TenantRepository<MemoryBackend>,
    }

    async fn fixture(config: StoreConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryBackend::with_tenant_tables(clock.clone()));
        let principal = Arc::new(StaticPrincipal::default());
        let repo = TenantRepository::open_with(
            Arc::clone(&backend),
            Arc::new(LocalLocks::new()),
            Arc::new(TieredCache::new(&config)),
            clock.clone(),
            principal.clone(),
            config,
        )
        .await
        .unwrap();
        Fixture {
            clock,
            backend,
            principal,
            repo,
        }
    }

    async fn default_fixture() -> Fixture {
        fixture(StoreConfig::builder().max_retries(0).build().unwrap()).await
    }

    #[tokio::test]
    async fn create_normalizes_and_finds() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("  Alice@Example.com ").await.unwrap();
        assert_eq!(created.principal_email, "alice@example.com");
        assert!(created.active);
        assert!(Uuid::parse_str(&created.id).is_ok());

        let by_email = fx.repo.find_by_principal("ALICE@example.com").await.unwrap();
        assert_eq!(by_email.as_ref(), Some(&created));
        let by_id = fx.repo.find_by_id(&created.id).await.unwrap();
        assert_eq!(by_id, Some(created));
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let fx = default_fixture().await;
        fx.repo.create_tenant("alice@example.com").await.unwrap();
        let err = fx.repo.create_tenant("ALICE@example.com").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicateKey {
                field: KeyField::PrincipalEmail,
                ..
            }
        ));
        assert_eq!(fx.backend.rows("Tenants").len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let fx = default_fixture().await;
        assert!(matches!(
            fx.repo.create_tenant("not-an-email").await,
            Err(StoreError::Validation(_))
        ));

        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        let err = fx
            .repo
            .update_config(&created.id, |mut blob| {
                blob.display_mode = Some(" ".into());
                Ok(blob)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        // Nothing was written.
        assert_eq!(fx.repo.find_by_id(&created.id).await.unwrap(), Some(created));

        fx.backend.reset_calls();
        assert_eq!(fx.repo.find_by_principal("not-an-email").await.unwrap(), None);
        assert_eq!(fx.repo.find_by_principal("  ").await.unwrap(), None);
        assert_eq!(fx.backend.calls(Op::ReadRange), 0);
    }

    #[tokio::test]
    async fn cached_reads_skip_the_backend() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.backend.reset_calls();

        for _ in 0..3 {
            assert!(fx.repo.find_by_id(&created.id).await.unwrap().is_some());
            assert!(fx.repo.find_by_principal("alice@example.com").await.unwrap().is_some());
        }
        assert_eq!(fx.backend.calls(Op::ReadRange), 0);
        assert!(fx.repo.cache().stats().hits() >= 6);
    }

    #[tokio::test]
    async fn principal_tier_serves_the_owner() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.principal.set(Some("alice@example.com"));

        within_execution(async {
            fx.repo.find_by_id(&created.id).await.unwrap();
        })
        .await;

        let stats = fx.repo.cache().stats();
        assert_eq!(stats.principal_hits, 1);
        assert_eq!(stats.shared_hits, 0);
    }

    #[tokio::test]
    async fn cold_lookup_goes_through_index() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.repo.clear_caches().await;
        fx.backend.reset_calls();

        let found = fx.repo.find_by_principal("alice@example.com").await.unwrap();
        assert_eq!(found, Some(created));
        // Index scan plus the row itself.
        assert_eq!(fx.backend.calls(Op::ReadRange), 2);
    }

    #[tokio::test]
    async fn lookup_miss_picks_up_rows_written_elsewhere() {
        let fx = default_fixture().await;
        assert_eq!(fx.repo.find_by_id("t-ext").await.unwrap(), None);

        // Another process appends a row after our index was built.
        fx.clock.advance(chrono::Duration::seconds(1));
        let record = TenantRecord::new("t-ext", "ext@example.com", fx.clock.now());
        fx.backend
            .push_row("Tenants", codec::encode_tenant(&record).unwrap());

        assert_eq!(fx.repo.find_by_id("t-ext").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn moved_row_is_detected() {
        let fx = default_fixture().await;
        let alice = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.repo.find_by_id(&alice.id).await.unwrap();
        fx.repo.clear_caches().await;
        fx.repo.index().get_index().await.unwrap();

        // Someone else rewrites row 0 under our feet.
        let bob = TenantRecord::new("t-bob", "bob@example.com", fx.clock.now());
        fx.backend.put_row("Tenants", 0, codec::encode_tenant(&bob).unwrap());
        fx.backend.push_row("Tenants", codec::encode_tenant(&alice).unwrap());

        assert_eq!(fx.repo.find_by_id(&alice.id).await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn update_is_visible_and_monotonic() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.repo.find_by_id(&created.id).await.unwrap();

        // Clock going backwards must not make lastModified go backwards.
        fx.clock.advance(chrono::Duration::seconds(-30));
        let updated = fx
            .repo
            .update_config(&created.id, |mut blob| {
                blob.display_mode = Some("named".into());
                Ok(blob)
            })
            .await
            .unwrap();
        assert_eq!(updated.last_modified, created.last_modified);
        assert_eq!(updated.config_blob.display_mode.as_deref(), Some("named"));

        let found = fx.repo.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found, updated);
    }

    #[tokio::test]
    async fn deactivated_tenants_are_hidden() {
        let fx = default_fixture().await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.repo.set_active(&created.id, false).await.unwrap();

        assert_eq!(fx.repo.find_by_id(&created.id).await.unwrap(), None);
        assert_eq!(fx.repo.find_by_principal("alice@example.com").await.unwrap(), None);
        assert!(!fx.repo.find_any_by_id(&created.id).await.unwrap().unwrap().active);
        assert!(fx.repo.list_active_tenants().await.unwrap().is_empty());

        // Still holds its email.
        assert!(matches!(
            fx.repo.create_tenant("alice@example.com").await,
            Err(StoreError::DuplicateKey { .. })
        ));
        // And can't be configured until reactivated.
        assert!(matches!(
            fx.repo.update_config(&created.id, Ok).await,
            Err(StoreError::NotFound(_))
        ));
        fx.repo.set_active(&created.id, true).await.unwrap();
        assert!(fx.repo.find_by_id(&created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let fx = default_fixture().await;
        let err = fx
            .repo
            .delete_tenant("nope", "admin@example.com", "cleanup")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref id) if id == "nope"));
        assert!(fx.backend.rows("AuditLog").is_empty());
    }

    #[tokio::test]
    async fn stale_index_policy() {
        let fx = fixture(
            StoreConfig::builder()
                .max_retries(0)
                .allow_stale_index_reads(false)
                .build()
                .unwrap(),
        )
        .await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        fx.repo.find_by_id(&created.id).await.unwrap();
        fx.repo.clear_caches().await;

        fx.backend
            .fail_times(Op::ReadRange, BackendError::Network("reset".into()), 1);
        let err = fx.repo.find_by_id(&created.id).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn list_skips_corrupt_and_duplicate_rows() {
        let fx = default_fixture().await;
        let alice = fx.repo.create_tenant("alice@example.com").await.unwrap();
        let bob = fx.repo.create_tenant("bob@example.com").await.unwrap();
        fx.backend.push_row("Tenants", vec!["t-x".into(), "x@example.com".into(), "perhaps".into()]);
        fx.backend
            .push_row("Tenants", codec::encode_tenant(&alice).unwrap());

        let all = fx.repo.list_all(|_| true).await.unwrap();
        assert_eq!(all, vec![alice, bob]);

        let report = fx.repo.integrity_report().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.rows, 4);
        assert_eq!(report.id_duplicates.len(), 1);
        assert_eq!(report.email_duplicates.len(), 1);
        assert_eq!(report.id_duplicates[0].duplicate_offset, 3);
    }

    #[tokio::test]
    async fn record_scope_serializes_per_record() {
        let fx = fixture(
            StoreConfig::builder()
                .lock_scope(LockScope::Record)
                .lock_timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .await;
        let created = fx.repo.create_tenant("alice@example.com").await.unwrap();
        let ack = fx
            .repo
            .delete_tenant(&created.id, "admin@example.com", "test")
            .await
            .unwrap();
        assert_eq!(ack.audit, AuditStatus::Recorded);
    }
}
