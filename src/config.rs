//! Store configuration.
//!
//! [`StoreConfig`] is what the components consume. It is normally produced from [`StoreSettings`], which reads
//! `TENANT_STORE_*` environment variables (or command line arguments of the hosting binary) and validates them.

use std::fmt::Display;
use std::time::Duration;

use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;

use crate::error::Result;
use crate::error::StoreError;
use crate::lock::LockScope;

#[derive(Debug, Clone)]
#[fxstruct(sync, no_new, builder, get(copy))]
pub struct StoreConfig {
    #[fieldx(get(clone), builder(into), default(String::from("Tenants")))]
    tenant_table: String,

    #[fieldx(get(clone), builder(into), default(String::from("AuditLog")))]
    audit_table: String,

    /// Backend limit on ranges per batch call.
    #[fieldx(default(100))]
    max_ranges_per_batch: usize,

    /// Retries after the first attempt of a remote call.
    #[fieldx(default(5))]
    max_retries: u32,

    #[fieldx(default(Duration::from_millis(250)))]
    base_retry_delay: Duration,

    #[fieldx(default(Duration::from_secs(8)))]
    max_retry_delay: Duration,

    /// Bound on a single remote call attempt.
    #[fieldx(default(Duration::from_secs(30)))]
    call_timeout: Duration,

    #[fieldx(default(Duration::from_secs(300)))]
    index_max_age: Duration,

    #[fieldx(default(Duration::from_secs(300)))]
    shared_ttl: Duration,

    #[fieldx(default(Duration::from_secs(600)))]
    principal_ttl: Duration,

    #[fieldx(default(10_000))]
    shared_capacity: u64,

    #[fieldx(default(10_000))]
    principal_capacity: u64,

    #[fieldx(default(Duration::from_secs(10)))]
    lock_timeout: Duration,

    #[fieldx(default(LockScope::Table))]
    lock_scope: LockScope,

    /// Serve reads from an index whose last rebuild failed.
    #[fieldx(default(true))]
    allow_stale_index_reads: bool,
}

impl StoreConfig {
    /// Configuration with every value at its default.
    pub fn with_defaults() -> Result<Self> {
        Self::builder()
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "tenant-store")]
pub struct StoreSettings {
    /// Name of the table holding tenant records.
    #[clap(long, env = "TENANT_STORE_TENANT_TABLE", default_value = "Tenants")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1), custom(Self::differs_from("audit-table", &self.audit_table)))]
    tenant_table: String,

    /// Name of the append-only audit table.
    #[clap(long, env = "TENANT_STORE_AUDIT_TABLE", default_value = "AuditLog")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    audit_table: String,

    /// Maximum number of ranges the backend accepts in a single batch call.
    #[clap(long, env = "TENANT_STORE_MAX_RANGES_PER_BATCH", default_value_t = 100)]
    #[garde(range(min = 1))]
    max_ranges_per_batch: usize,

    /// How many times a rate-limited or failed call is retried.
    #[clap(long, env = "TENANT_STORE_MAX_RETRIES", default_value_t = 5)]
    #[garde(range(max = 20))]
    max_retries: u32,

    /// First backoff delay; doubles on every retry.
    #[clap(long, env = "TENANT_STORE_BASE_RETRY_DELAY_MS", default_value_t = 250)]
    #[garde(range(min = 1), custom(Self::not_more_than("max-retry-delay-ms", &self.max_retry_delay_ms)))]
    base_retry_delay_ms: u64,

    /// Upper bound for a single backoff delay.
    #[clap(long, env = "TENANT_STORE_MAX_RETRY_DELAY_MS", default_value_t = 8_000)]
    #[garde(range(min = 1))]
    max_retry_delay_ms: u64,

    /// Timeout of a single remote call attempt.
    #[clap(long, env = "TENANT_STORE_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    #[garde(range(min = 1))]
    call_timeout_ms: u64,

    /// Age after which the row index is rebuilt on next use.
    #[clap(long, env = "TENANT_STORE_INDEX_MAX_AGE_SECS", default_value_t = 300)]
    #[garde(range(min = 1))]
    index_max_age_secs: u64,

    #[clap(long, env = "TENANT_STORE_SHARED_TTL_SECS", default_value_t = 300)]
    #[garde(range(min = 1))]
    shared_ttl_secs: u64,

    #[clap(long, env = "TENANT_STORE_PRINCIPAL_TTL_SECS", default_value_t = 600)]
    #[garde(range(min = 1))]
    principal_ttl_secs: u64,

    #[clap(long, env = "TENANT_STORE_SHARED_CAPACITY", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    shared_capacity: u64,

    #[clap(long, env = "TENANT_STORE_PRINCIPAL_CAPACITY", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    principal_capacity: u64,

    /// How long a writer waits for the table or record lock.
    #[clap(long, env = "TENANT_STORE_LOCK_TIMEOUT_MS", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    lock_timeout_ms: u64,

    #[clap(long, env = "TENANT_STORE_LOCK_SCOPE", value_enum, default_value_t = LockScope::Table)]
    #[garde(skip)]
    lock_scope: LockScope,

    /// Serve reads from a possibly stale index when a rebuild fails.
    #[clap(
        long,
        env = "TENANT_STORE_ALLOW_STALE_INDEX_READS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    #[garde(skip)]
    allow_stale_index_reads: bool,
}

impl StoreSettings {
    /// Settings taken from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::from_args([env!("CARGO_PKG_NAME")])
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let settings = Self::try_parse_from(args)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_config(&self) -> Result<StoreConfig> {
        StoreConfig::builder()
            .tenant_table(self.tenant_table())
            .audit_table(self.audit_table())
            .max_ranges_per_batch(self.max_ranges_per_batch())
            .max_retries(self.max_retries())
            .base_retry_delay(Duration::from_millis(self.base_retry_delay_ms()))
            .max_retry_delay(Duration::from_millis(self.max_retry_delay_ms()))
            .call_timeout(Duration::from_millis(self.call_timeout_ms()))
            .index_max_age(Duration::from_secs(self.index_max_age_secs()))
            .shared_ttl(Duration::from_secs(self.shared_ttl_secs()))
            .principal_ttl(Duration::from_secs(self.principal_ttl_secs()))
            .shared_capacity(self.shared_capacity())
            .principal_capacity(self.principal_capacity())
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms()))
            .lock_scope(self.lock_scope())
            .allow_stale_index_reads(self.allow_stale_index_reads())
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))
    }

    fn not_more_than<'a, T: PartialOrd + Display>(
        max_name: &'static str,
        max: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value > max {
                Err(garde::Error::new(format!("{} is more than {max_name} ({})", *value, *max)))
            }
            else {
                Ok(())
            }
        }
    }

    fn differs_from<'a>(other_name: &'static str, other: &'a String) -> impl FnOnce(&'a String, &()) -> garde::Result {
        move |value, _| {
            if value == other {
                Err(garde::Error::new(format!("must differ from {other_name} ('{other}')")))
            }
            else {
                Ok(())
            }
        }
    }
}
