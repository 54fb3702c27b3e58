#![allow(dead_code)]

use std::sync::Arc;

use tenant_store::prelude::*;
use tenant_store::test::ManualClock;
use tenant_store::test::MemoryBackend;
use tenant_store::test::StaticPrincipal;

/// Store configuration as the hosting binary would get it from `args`.
pub fn settings(args: &[&str]) -> Result<StoreConfig, StoreError> {
    StoreSettings::from_args(std::iter::once("tenant-store").chain(args.iter().copied()))?.to_config()
}

pub struct Harness {
    pub clock:     Arc<ManualClock>,
    pub backend:   Arc<MemoryBackend>,
    pub locks:     Arc<LocalLocks>,
    pub principal: Arc<StaticPrincipal>,
    pub repo:      Arc<TenantRepository<MemoryBackend>>,
}

impl Harness {
    pub async fn new() -> Result<Self, StoreError> {
        Self::with_config(StoreConfig::with_defaults()?).await
    }

    pub async fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        let cache = Arc::new(TieredCache::new(&config));
        Self::with_cache(config, cache).await
    }

    pub async fn with_cache(config: StoreConfig, cache: Arc<TieredCache<CachedTenant>>) -> Result<Self, StoreError> {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryBackend::with_tenant_tables(clock.clone()));
        let locks = Arc::new(LocalLocks::new());
        let principal = Arc::new(StaticPrincipal::default());
        let repo = TenantRepository::open_with(
            Arc::clone(&backend),
            Arc::clone(&locks),
            cache,
            clock.clone(),
            principal.clone(),
            config,
        )
        .await?;

        Ok(Self {
            clock,
            backend,
            locks,
            principal,
            repo: Arc::new(repo),
        })
    }
}
