//! Database driver binding used by resource pools.
//!
//! Pools never speak any database protocol themselves. Everything they need from a driver is
//! expressed through the traits in this module, which are implemented by an externally supplied
//! adapter.

use std::{fmt, sync::Arc};

use zeroize::Zeroizing;

/// Error type returned by driver bindings.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Logical or raw database connection handle.
pub trait Connection: Send {
    /// Whether this handle has been closed.
    fn is_closed(&self) -> bool;

    /// Close this handle.
    ///
    /// For a logical handle obtained from a [`PhysicalConnection`] this only releases the handle,
    /// leaving the physical connection open.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the driver failed to close the connection.
    fn close(&mut self) -> Result<(), AdapterError>;

    /// Commit current transaction.
    ///
    /// # Errors
    ///
    /// Returns `Err` on driver failure.
    fn commit(&mut self) -> Result<(), AdapterError>;

    /// Roll back current transaction.
    ///
    /// # Errors
    ///
    /// Returns `Err` on driver failure.
    fn rollback(&mut self) -> Result<(), AdapterError>;

    /// Switch auto-commit mode.
    ///
    /// # Errors
    ///
    /// Returns `Err` on driver failure.
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), AdapterError>;
}

/// Observer of physical connection lifecycle events.
///
/// Drivers may invoke these from any thread, including from inside a call to
/// [`Connection::close`]. Implementations must not block.
pub trait ConnectionEventListener: Send + Sync {
    /// Logical handle was closed by its user.
    fn connection_closed(&self);

    /// Fatal error occurred, physical connection is no longer usable.
    fn connection_error_occurred(&self, error: &AdapterError);
}

/// Reusable physical connection managed by the driver itself.
pub trait PhysicalConnection: Send {
    /// Obtain a fresh logical handle wrapping this physical connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the driver could not produce a handle.
    fn connection(&mut self) -> Result<Box<dyn Connection>, AdapterError>;

    /// Whether the physical connection has been closed.
    fn is_closed(&self) -> bool;

    /// Close the physical connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the driver failed to close the connection.
    fn close(&mut self) -> Result<(), AdapterError>;

    /// Register lifecycle event listener.
    fn add_listener(&mut self, listener: Arc<dyn ConnectionEventListener>);

    /// Unregister previously added lifecycle event listener.
    fn remove_listener(&mut self, listener: &Arc<dyn ConnectionEventListener>);
}

/// Factory for driver-managed physical connections.
pub trait PooledConnectionSource: Send + Sync {
    /// Open a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection could not be established.
    fn pooled_connection(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn PhysicalConnection>, AdapterError>;
}

/// Database adapter.
///
/// Each pool owns exactly one adapter, built from the pool's [`ConnectionParams`].
pub trait DatabaseAdapter: Send + Sync {
    /// Open a new raw connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection could not be established.
    fn connect(&self) -> Result<Box<dyn Connection>, AdapterError>;

    /// Driver-native connection pooling support, if any.
    ///
    /// Probed once, when a pool is constructed.
    fn pooled_source(&self) -> Option<Arc<dyn PooledConnectionSource>> {
        None
    }
}

/// Parameters used to connect to a database.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionParams {
    /// Driver identifier.
    pub driver: String,
    /// Database URL.
    pub url: String,
    /// User name.
    pub username: String,
    /// User password.
    pub password: Zeroizing<String>,
}

impl ConnectionParams {
    /// Bundle connection parameters.
    pub fn new(
        driver: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
