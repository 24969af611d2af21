//! Error types and error support code.

use crate::adapter::AdapterError;

/// Error type used by resource pools and pooled resources.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No resource became available within the configured wait timeout.
    #[error("connection wait timeout in pool {pool} ({url})")]
    WaitTimeout {
        /// Pool name.
        pool: String,
        /// Database URL of the pool.
        url: String,
    },
    /// Pool bookkeeping found no resource where one was accounted for.
    ///
    /// This signals an internal accounting bug and is always logged.
    #[error("pool is exhausted: attempted to take a connection from an empty pool")]
    PoolExhausted,
    /// Resource was returned to, or unlinked from, a pool that does not own it.
    #[error("trying to unlink from the wrong pool")]
    WrongPool,
    /// Resource has no logical connection handle.
    #[error("connection object is null")]
    NullHandle,
    /// Logical connection handle was already closed.
    #[error("connection is closed")]
    HandleClosed,
    /// Resource has already been returned to its pool.
    #[error("connection has already been released")]
    Released,
    /// Resource lease was revoked after being checked out for too long.
    #[error("connection lease was revoked")]
    Revoked,
    /// Pool has been shut down.
    #[error("pool {0} has been shut down")]
    ShutDown(String),
    /// Database driver error.
    #[error("database driver error: {0}")]
    Adapter(#[source] AdapterError),
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Self::Adapter(err)
    }
}

impl Error {
    /// Whether this error is an acquisition timeout.
    ///
    /// Callers may retry acquisition after this kind of error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}
