//! In-memory database driver for testing purposes.
//!
//! Supports both raw connections and driver-native pooling, counts every open and close, and lets
//! tests inject lifecycle events and connection failures.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::adapter::{
    AdapterError, Connection, ConnectionEventListener, DatabaseAdapter, PhysicalConnection,
    PooledConnectionSource,
};

/// Driver-wide counters and switches.
#[derive(Debug, Default)]
struct DriverState {
    /// Connections (raw or physical) opened so far.
    opened: AtomicUsize,
    /// Connections (raw or physical) closed so far.
    closed: AtomicUsize,
    /// Logical handles produced by physical connections.
    handles: AtomicUsize,
    /// Transactions committed.
    commits: AtomicUsize,
    /// Transactions rolled back.
    rollbacks: AtomicUsize,
    /// Refuse new connections.
    refuse: AtomicBool,
    /// Physical connections, in opening order.
    physical: Mutex<Vec<Arc<PhysicalState>>>,
}

impl DriverState {
    fn check_refused(&self) -> Result<(), AdapterError> {
        if self.refuse.load(Ordering::Acquire) {
            return Err("connection refused".into());
        }
        Ok(())
    }
}

/// Mock database driver.
///
/// Clones share counters, so a test can keep one handle while the pool owns another.
#[derive(Clone, Debug)]
pub struct MockDriver {
    native: bool,
    state: Arc<DriverState>,
}

impl MockDriver {
    /// Driver without native pooling, pools wrap raw connections.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            native: false,
            state: Arc::default(),
        }
    }

    /// Driver with native pooling, pools wrap physical connections.
    #[must_use]
    pub fn native() -> Self {
        Self {
            native: true,
            state: Arc::default(),
        }
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    /// Number of connections closed so far.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    /// Number of logical handles produced by physical connections.
    #[must_use]
    pub fn handles(&self) -> usize {
        self.state.handles.load(Ordering::Acquire)
    }

    /// Number of transactions committed over all connections.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::Acquire)
    }

    /// Number of transactions rolled back over all connections.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::Acquire)
    }

    /// Make every following connection attempt fail, or succeed again.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::Release);
    }

    /// Physical connection opened `index`-th, starting from zero.
    #[must_use]
    pub fn physical(&self, index: usize) -> Option<MockPhysicalHandle> {
        self.state
            .physical
            .lock()
            .get(index)
            .cloned()
            .map(MockPhysicalHandle)
    }
}

impl DatabaseAdapter for MockDriver {
    fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        self.state.check_refused()?;
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockConnection {
            driver: self.state.clone(),
            physical: None,
            closed: false,
        }))
    }

    fn pooled_source(&self) -> Option<Arc<dyn PooledConnectionSource>> {
        if self.native {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }
}

impl PooledConnectionSource for MockDriver {
    fn pooled_connection(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Box<dyn PhysicalConnection>, AdapterError> {
        self.state.check_refused()?;
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        let physical = Arc::new(PhysicalState::default());
        self.state.physical.lock().push(physical.clone());
        Ok(Box::new(MockPhysical {
            driver: self.state.clone(),
            state: physical,
        }))
    }
}

/// Shared state of a physical connection.
#[derive(Default)]
struct PhysicalState {
    closed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl PhysicalState {
    fn listeners(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners.lock().clone()
    }

    fn fire_closed(&self) {
        for listener in self.listeners() {
            listener.connection_closed();
        }
    }

    fn fire_error(&self, error: &AdapterError) {
        for listener in self.listeners() {
            listener.connection_error_occurred(error);
        }
    }
}

impl std::fmt::Debug for PhysicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalState")
            .field("closed", &self.closed)
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Test-side handle to a physical connection, used to inject driver events.
#[derive(Clone, Debug)]
pub struct MockPhysicalHandle(Arc<PhysicalState>);

impl MockPhysicalHandle {
    /// Report a fatal error to all registered listeners.
    pub fn fail(&self, message: &str) {
        let error: AdapterError = message.to_owned().into();
        self.0.fire_error(&error);
    }

    /// Whether the physical connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listeners(&self) -> usize {
        self.0.listeners.lock().len()
    }
}

/// Physical connection of [`MockDriver`].
struct MockPhysical {
    driver: Arc<DriverState>,
    state: Arc<PhysicalState>,
}

impl PhysicalConnection for MockPhysical {
    fn connection(&mut self) -> Result<Box<dyn Connection>, AdapterError> {
        if self.is_closed() {
            return Err("physical connection is closed".into());
        }
        self.driver.handles.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockConnection {
            driver: self.driver.clone(),
            physical: Some(self.state.clone()),
            closed: false,
        }))
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.driver.closed.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn add_listener(&mut self, listener: Arc<dyn ConnectionEventListener>) {
        self.state.listeners.lock().push(listener);
    }

    fn remove_listener(&mut self, listener: &Arc<dyn ConnectionEventListener>) {
        let target = Arc::as_ptr(listener).cast::<()>();
        self.state
            .listeners
            .lock()
            .retain(|l| Arc::as_ptr(l).cast::<()>() != target);
    }
}

/// Raw connection, or logical handle of a physical connection.
#[derive(Debug)]
pub struct MockConnection {
    driver: Arc<DriverState>,
    physical: Option<Arc<PhysicalState>>,
    closed: bool,
}

impl MockConnection {
    fn check_open(&self) -> Result<(), AdapterError> {
        if self.is_closed() {
            return Err("connection is closed".into());
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed
            || self
                .physical
                .as_ref()
                .is_some_and(|p| p.closed.load(Ordering::Acquire))
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &self.physical {
            // Logical handle: physical connection stays open, listeners are told.
            Some(physical) => physical.fire_closed(),
            None => {
                self.driver.closed.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), AdapterError> {
        self.check_open()?;
        self.driver.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), AdapterError> {
        self.check_open()?;
        self.driver.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn set_auto_commit(&mut self, _auto_commit: bool) -> Result<(), AdapterError> {
        self.check_open()
    }
}
