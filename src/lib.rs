//! # tenant-store
//!
//! Multi-tenant configuration store and caching layer for applications whose only database is a remote, slow and
//! rate-limited row store: think of a spreadsheet service with a tabular API.
//!
//! The backend offers none of the things a database would. It can't look rows up by value, doesn't lock, and answers
//! every call with a network round-trip that may be refused when the quota runs out. This crate builds the missing
//! parts on top of it:
//!
//! - lookup by tenant id or principal email through an in-memory [row index](index);
//! - a [three-tier cache](cache): request-scoped, shared, and per-principal;
//! - serialized read-modify-write through a [lock-guarded writer](lock);
//! - batching, retries with exponential backoff and per-call timeouts in the [client](client);
//! - an [audit trail](audit) of deletions.
//!
//! Everything is reached through [`TenantRepository`](repository::TenantRepository).
//!
//! # Data Flow
//!
//! A lookup checks the execution tier, then the tier of the current principal, then the shared one. On a miss
//! everywhere the index gives the row offset, the single row is fetched and checked to still hold the requested key,
//! and the record is put into every tier before being returned.
//!
//! A write takes the lock, re-reads the row from the backend bypassing every cache, applies the change, evicts cached
//! copies, writes the row, and only then repopulates the caches.
//!
//! # Backend
//!
//! The remote store is anything implementing [`RowBackend`](traits::RowBackend). Tables are expected to have a header
//! row; the tenant table holds `id, principalEmail, active, configBlob, lastModified` and the audit table
//! `timestamp, actorPrincipal, targetRecordId, targetPrincipalEmail, reason`. Both headers are verified when the
//! repository opens.
//!
//! # Crate Features
//!
//! - `tracing` adds `telemetry::init()` which installs a `tracing-subscriber` based subscriber.
//! - `test` exposes the in-memory collaborators of the `test` module to other crates.

pub mod audit;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod lock;
pub mod repository;
pub mod telemetry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use error::StoreError;
#[doc(inline)]
pub use repository::TenantRepository;

pub mod prelude {
    pub use crate::cache::within_execution;
    pub use crate::cache::CacheStats;
    pub use crate::cache::Tier;
    pub use crate::cache::TieredCache;
    pub use crate::config::StoreConfig;
    pub use crate::config::StoreSettings;
    pub use crate::error::BackendError;
    pub use crate::error::Result;
    pub use crate::error::StoreError;
    pub use crate::lock::LocalLocks;
    pub use crate::lock::LockScope;
    pub use crate::repository::CachedTenant;
    pub use crate::repository::TenantRepository;
    pub use crate::traits::*;
    pub use crate::types::*;
}
