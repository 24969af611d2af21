use poolbroker_pools::{AdapterError, Error as PoolError};
use thiserror::Error;

/// Error type returned by [`PoolRegistry`](crate::PoolRegistry).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Database adapter for a pool could not be constructed.
    #[error("Unable to register connection pool {name}: {source}")]
    Registration {
        /// Logical pool name.
        name: String,
        /// Adapter error.
        #[source]
        source: AdapterError,
    },
    /// No configuration exists for a pool.
    #[error("No configuration for connection pool {0}")]
    UnknownPool(String),
    /// No adapter factory is registered for a driver.
    #[error("Unknown database driver {0}")]
    UnknownDriver(String),
    /// Background task was requested outside of a Tokio runtime.
    #[error("Unable to start background task: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    /// Pool operation failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl RegistryError {
    /// Whether this error was caused by an acquisition timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Pool(err) if err.is_timeout())
    }
}
