//! Database adapter construction by driver identifier.

use std::{collections::BTreeMap, fmt, sync::Arc};

use poolbroker_pools::{AdapterError, ConnectionParams, DatabaseAdapter};

/// Constructor of database adapters for one driver.
pub trait AdapterFactory: Send + Sync {
    /// Build an adapter for the given connection parameters.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the driver rejects the parameters.
    fn create(&self, params: &ConnectionParams) -> Result<Arc<dyn DatabaseAdapter>, AdapterError>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&ConnectionParams) -> Result<Arc<dyn DatabaseAdapter>, AdapterError> + Send + Sync,
{
    fn create(&self, params: &ConnectionParams) -> Result<Arc<dyn DatabaseAdapter>, AdapterError> {
        self(params)
    }
}

/// Map of driver identifiers to adapter factories.
#[derive(Clone, Default)]
#[must_use]
pub struct DriverRegistry {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
}

impl DriverRegistry {
    /// Create empty driver registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register adapter factory for a driver identifier, replacing any previous one.
    pub fn with_driver<F>(mut self, driver: impl Into<String>, factory: F) -> Self
    where
        F: AdapterFactory + 'static,
    {
        self.register(driver, factory);
        self
    }

    /// Register adapter factory for a driver identifier, replacing any previous one.
    pub fn register<F>(&mut self, driver: impl Into<String>, factory: F)
    where
        F: AdapterFactory + 'static,
    {
        self.factories.insert(driver.into(), Arc::new(factory));
    }

    /// Adapter factory registered for `driver`.
    #[must_use]
    pub fn get(&self, driver: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(driver).cloned()
    }

    /// Whether a factory is registered for `driver`.
    #[must_use]
    pub fn contains(&self, driver: &str) -> bool {
        self.factories.contains_key(driver)
    }

    /// Registered driver identifiers, in sorted order.
    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
