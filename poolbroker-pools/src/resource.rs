//! Pooled connections and their checkout guard.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    adapter::{AdapterError, Connection, ConnectionEventListener, PhysicalConnection},
    error::Error,
    pool::PoolShared,
};

/// Lifecycle event flags of one pooled connection.
///
/// Registered with the driver as a [`ConnectionEventListener`]. Events on a checked out connection
/// only flip flags, acted upon by the guard holding it, so a driver calling back from inside
/// [`Connection::close`] never re-enters the pool. A fatal error on an idle connection makes the
/// pool discard it right away.
#[derive(Debug)]
pub(crate) struct ResourceListener {
    /// Pool the connection belongs to.
    pool: Weak<PoolShared>,
    /// Logical handle was closed by the caller.
    closed: AtomicBool,
    /// Driver reported a fatal error.
    failed: AtomicBool,
    /// Lease was revoked by an abandoned checkout sweep.
    revoked: AtomicBool,
}

impl ResourceListener {
    pub(crate) fn new(pool: Weak<PoolShared>) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
        }
    }

    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn take_closed(&self) -> bool {
        self.closed.swap(false, Ordering::AcqRel)
    }

    fn clear_closed(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

impl ConnectionEventListener for ResourceListener {
    fn connection_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn connection_error_occurred(&self, error: &AdapterError) {
        warn!(%error, "closing down connection due to driver error");
        self.failed.store(true, Ordering::Release);
        if let Some(pool) = self.pool.upgrade() {
            pool.discard_failed();
        }
    }
}

/// Underlying driver object.
enum Backing {
    /// Raw connection owned and wrapped by the pool.
    Manual(Box<dyn Connection>),
    /// Driver-managed physical connection, with the logical handle of the current checkout.
    Native {
        physical: Box<dyn PhysicalConnection>,
        handle: Option<Box<dyn Connection>>,
    },
}

/// One reusable database connection.
pub(crate) struct Resource {
    /// Creation time, used for age-based expiry.
    created_at: Instant,
    /// Driver connection.
    backing: Backing,
    /// Lease of the current checkout, `None` while idle.
    lease: Option<u64>,
    /// Lifecycle event flags.
    listener: Arc<ResourceListener>,
}

impl Resource {
    /// Wrap a raw connection.
    pub(crate) fn manual(connection: Box<dyn Connection>, listener: Arc<ResourceListener>) -> Self {
        Self {
            created_at: Instant::now(),
            backing: Backing::Manual(connection),
            lease: None,
            listener,
        }
    }

    /// Wrap a driver-managed physical connection and subscribe to its events.
    pub(crate) fn native(
        mut physical: Box<dyn PhysicalConnection>,
        listener: Arc<ResourceListener>,
    ) -> Self {
        physical.add_listener(listener.clone());
        Self {
            created_at: Instant::now(),
            backing: Backing::Native {
                physical,
                handle: None,
            },
            lease: None,
            listener,
        }
    }

    pub(crate) fn listener(&self) -> &Arc<ResourceListener> {
        &self.listener
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Associate with a checkout lease.
    ///
    /// In native mode this eagerly obtains a fresh logical handle.
    pub(crate) fn link(&mut self, lease: u64) {
        self.lease = Some(lease);
        self.listener.clear_closed();
        if let Backing::Native { physical, handle } = &mut self.backing {
            if handle.is_none() {
                match physical.connection() {
                    Ok(conn) => *handle = Some(conn),
                    Err(error) => warn!(%error, "unable to obtain logical connection handle"),
                }
            }
        }
    }

    /// Dissociate from a checkout lease.
    ///
    /// In native mode the logical handle is closed, the physical connection stays open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPool`] if `lease` is not the current lease.
    pub(crate) fn unlink(&mut self, lease: u64) -> Result<(), Error> {
        if self.lease != Some(lease) {
            return Err(Error::WrongPool);
        }
        self.lease = None;
        if let Backing::Native { handle, .. } = &mut self.backing {
            if let Some(mut conn) = handle.take() {
                if !conn.is_closed() {
                    if let Err(error) = conn.close() {
                        debug!(%error, "error closing logical connection handle");
                    }
                }
            }
        }
        // Closing the logical handle above makes the driver report it as closed by the caller.
        self.listener.clear_closed();
        Ok(())
    }

    /// Current logical connection handle.
    pub(crate) fn handle(&mut self) -> Result<&mut dyn Connection, Error> {
        let conn = match &mut self.backing {
            Backing::Manual(conn) => conn,
            Backing::Native { handle, .. } => handle.as_mut().ok_or(Error::NullHandle)?,
        };
        if conn.is_closed() {
            return Err(Error::HandleClosed);
        }
        Ok(&mut **conn)
    }

    /// Whether the underlying connection is still open and healthy.
    pub(crate) fn is_open(&self) -> bool {
        if self.listener.is_failed() || self.listener.is_revoked() {
            return false;
        }
        match &self.backing {
            Backing::Manual(conn) => !conn.is_closed(),
            Backing::Native { physical, .. } => !physical.is_closed(),
        }
    }

    /// Whether this connection is older than `expiry_time`.
    pub(crate) fn is_expired(&self, expiry_time: Duration) -> bool {
        self.created_at.elapsed() > expiry_time
    }

    /// Close the underlying connection outright.
    pub(crate) fn close(&mut self) -> Result<(), AdapterError> {
        match &mut self.backing {
            Backing::Manual(conn) => {
                if conn.is_closed() {
                    return Ok(());
                }
                conn.close().inspect_err(|error| {
                    warn!(%error, "couldn't close database connection");
                })
            }
            Backing::Native { physical, handle } => {
                if let Some(mut conn) = handle.take() {
                    let _ = conn.close();
                }
                let listener: Arc<dyn ConnectionEventListener> = self.listener.clone();
                physical.remove_listener(&listener);
                if physical.is_closed() {
                    return Ok(());
                }
                physical.close()
            }
        }
    }

    /// Whether the current logical handle is missing or closed.
    fn is_handle_closed(&self) -> bool {
        match &self.backing {
            Backing::Manual(conn) => conn.is_closed(),
            Backing::Native { handle, .. } => handle.as_ref().map_or(true, |conn| conn.is_closed()),
        }
    }

    /// Close both physical and logical handles after a fatal driver error.
    pub(crate) fn force_close(&mut self) {
        if let Backing::Native { physical, handle } = &mut self.backing {
            let listener: Arc<dyn ConnectionEventListener> = self.listener.clone();
            physical.remove_listener(&listener);
            let _ = physical.close();
            if let Some(conn) = handle.as_mut() {
                let _ = conn.close();
            }
        } else if let Err(error) = self.close() {
            debug!(%error, "error closing failed connection");
        }
    }
}

/// Database connection checked out of a [`ResourcePool`].
///
/// The connection goes back to its pool when [`PooledResource::release`] is called, when its
/// [`ConnectionHandle`] is closed, or when this guard is dropped, whichever comes first. A close
/// reported by the driver on its own is acted upon the next time the guard is touched. Releasing
/// more than once is a no-op.
///
/// [`ResourcePool`]: crate::ResourcePool
pub struct PooledResource {
    /// Owning pool.
    pool: Arc<PoolShared>,
    /// Lease of this checkout.
    lease: u64,
    /// Checkout time.
    checked_out_at: Instant,
    /// Lifecycle event flags, kept after the resource itself is gone.
    listener: Arc<ResourceListener>,
    /// Connection, `None` after release.
    resource: Option<Resource>,
}

impl PooledResource {
    /// Bundle a linked resource with its owning pool.
    pub(crate) fn new(pool: Arc<PoolShared>, lease: u64, resource: Resource) -> Self {
        Self {
            pool,
            lease,
            checked_out_at: Instant::now(),
            listener: resource.listener().clone(),
            resource: Some(resource),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    /// Name of the pool this connection came from.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Whether this connection has already been returned to its pool.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.resource.is_none()
    }

    /// Time the underlying connection was created at.
    ///
    /// Returns `None` after release.
    #[must_use]
    pub fn created_at(&self) -> Option<Instant> {
        self.resource.as_ref().map(Resource::created_at)
    }

    /// Age of the underlying connection.
    ///
    /// Returns `None` after release.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.created_at().map(|created| created.elapsed())
    }

    /// Get current logical connection handle.
    ///
    /// Closing the returned handle releases this connection back to its pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the handle is missing or closed, if this connection was already returned to
    /// its pool, or if its lease was revoked.
    pub fn handle(&mut self) -> Result<ConnectionHandle<'_>, Error> {
        self.connection()?;
        Ok(ConnectionHandle { guard: self })
    }

    fn connection(&mut self) -> Result<&mut dyn Connection, Error> {
        self.process_events();
        match self.resource.as_mut() {
            Some(resource) => resource.handle(),
            None if self.listener.is_revoked() => Err(Error::Revoked),
            None => Err(Error::Released),
        }
    }

    /// Commit current transaction.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the handle is unavailable or the driver fails.
    pub fn commit(&mut self) -> Result<(), Error> {
        self.connection()?.commit().map_err(Error::Adapter)
    }

    /// Roll back current transaction.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the handle is unavailable or the driver fails.
    pub fn rollback(&mut self) -> Result<(), Error> {
        self.connection()?.rollback().map_err(Error::Adapter)
    }

    /// Switch auto-commit mode.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the handle is unavailable or the driver fails.
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Error> {
        self.connection()?
            .set_auto_commit(auto_commit)
            .map_err(Error::Adapter)
    }

    /// Return this connection to its pool.
    ///
    /// Calling this more than once has no effect.
    pub fn release(&mut self) {
        self.process_events();
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource, self.lease, self.checked_out_at);
        }
    }

    /// Act on lifecycle events delivered by the driver since the last call.
    fn process_events(&mut self) {
        let Some(resource) = self.resource.as_mut() else {
            return;
        };
        if self.listener.is_revoked() {
            if let Some(mut resource) = self.resource.take() {
                debug!(pool = %self.pool.name(), lease = self.lease, "closing revoked connection");
                let _ = resource.close();
            }
            return;
        }
        if self.listener.is_failed() {
            resource.force_close();
        }
        if self.listener.take_closed() {
            debug!(pool = %self.pool.name(), lease = self.lease, "connection closed by caller");
            if let Some(resource) = self.resource.take() {
                self.pool.release(resource, self.lease, self.checked_out_at);
            }
        }
    }
}

impl fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.name())
            .field("lease", &self.lease)
            .field("released", &self.resource.is_none())
            .finish()
    }
}

impl Drop for PooledResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Logical connection handle of a checked out [`PooledResource`].
///
/// Closing it hands the connection back to the pool immediately, even while the guard itself is
/// still alive.
pub struct ConnectionHandle<'a> {
    guard: &'a mut PooledResource,
}

impl Connection for ConnectionHandle<'_> {
    fn is_closed(&self) -> bool {
        self.guard
            .resource
            .as_ref()
            .map_or(true, Resource::is_handle_closed)
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        let closed = match self.guard.resource.as_mut().map(Resource::handle) {
            Some(Ok(conn)) => conn.close(),
            _ => Ok(()),
        };
        self.guard.release();
        closed
    }

    fn commit(&mut self) -> Result<(), AdapterError> {
        self.guard.connection()?.commit()
    }

    fn rollback(&mut self) -> Result<(), AdapterError> {
        self.guard.connection()?.rollback()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), AdapterError> {
        self.guard.connection()?.set_auto_commit(auto_commit)
    }
}

impl fmt::Debug for ConnectionHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("pool", &self.guard.pool.name())
            .field("lease", &self.guard.lease)
            .field("closed", &self.is_closed())
            .finish()
    }
}
