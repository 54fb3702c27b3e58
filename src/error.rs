use std::time::Duration;

use thiserror::Error;

use crate::types::KeyField;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Raw failure reported by a [`RowBackend`](crate::traits::RowBackend) implementation.
///
/// The row store client decides what to do with it: retryable kinds are retried with backoff, everything else is
/// surfaced as [`StoreError::Fatal`] untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retry-safe failure: the backend kept rate limiting or dropping calls until the retry budget ran out.
    #[error("transient failure in {operation} after {attempts} attempt(s): {message}")]
    Transient {
        operation: &'static str,
        attempts:  u32,
        message:   String,
    },

    #[error("fatal failure in {operation}: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source:    BackendError,
    },

    #[error("header of table '{table}' does not match: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        table:    String,
        expected: Vec<String>,
        found:    Vec<String>,
    },

    #[error("row {offset} of table '{table}' is corrupt: {reason}")]
    CorruptRow {
        table:  String,
        offset: usize,
        reason: String,
    },

    #[error("{field} '{key}' is already registered")]
    DuplicateKey { field: KeyField, key: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("lock '{key}' was not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("lock '{key}' is already held by the current call stack")]
    LockReentrancy { key: String },

    #[error("tenant '{0}' not found")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Errors a higher layer may retry later without treating them as data problems.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::LockTimeout { .. })
    }

    pub(crate) fn validation<S: ToString>(msg: S) -> Self {
        Self::Validation(msg.to_string())
    }
}

impl From<garde::Report> for StoreError {
    fn from(report: garde::Report) -> Self {
        Self::Config(report.to_string())
    }
}

impl From<clap::Error> for StoreError {
    fn from(err: clap::Error) -> Self {
        Self::Config(err.to_string())
    }
}
