//! Named registry of connection pools.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use poolbroker_pools::{
    ConnectionParams, DatabaseAdapter, PoolConfig, PoolState, PooledResource, ResourcePool,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    config::DatabaseConfig,
    drivers::DriverRegistry,
    errors::RegistryError,
    monitor::{Monitor, PoolMap},
};

/// Name-keyed set of connection pools.
///
/// Pools described in [`DatabaseConfig`] are created on first use. At most one pool exists per
/// name, no matter how many threads ask for it concurrently.
///
/// Background tasks (utilization monitor and abandoned checkout reaper) run on the Tokio runtime
/// they were started from, and stop when the registry is shut down or dropped.
pub struct PoolRegistry {
    /// Pool configuration.
    config: DatabaseConfig,
    /// Adapter factories.
    drivers: DriverRegistry,
    /// Registered pools.
    pools: PoolMap,
    /// Serializes pool creation, lookups only take the map lock.
    registering: Mutex<()>,
    /// Utilization monitor, if running.
    monitor: Mutex<Option<Monitor>>,
    /// Abandoned checkout reaper, if running.
    reaper: Mutex<Option<Monitor>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: DatabaseConfig, drivers: DriverRegistry) -> Self {
        Self {
            config,
            drivers,
            pools: PoolMap::default(),
            registering: Mutex::new(()),
            monitor: Mutex::new(None),
            reaper: Mutex::new(None),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Already registered pool, if any.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<ResourcePool> {
        self.pools.read().get(name).cloned()
    }

    /// Look up a pool, registering it from configuration if needed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool is not configured, its driver is unknown, or its adapter could
    /// not be constructed.
    pub fn get_or_register(&self, name: &str) -> Result<ResourcePool, RegistryError> {
        if let Some(pool) = self.pool(name) {
            return Ok(pool);
        }
        let entry = self
            .config
            .pool(name)
            .ok_or_else(|| RegistryError::UnknownPool(name.to_owned()))?;
        self.insert(name, entry.params(), self.config.pool_config(name))
    }

    /// Register a pool explicitly.
    ///
    /// If a pool with this name already exists, it is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the driver is unknown or the adapter could not be constructed.
    pub fn register_pool(
        &self,
        name: &str,
        params: ConnectionParams,
        limits: PoolConfig,
    ) -> Result<ResourcePool, RegistryError> {
        if let Some(pool) = self.pool(name) {
            return Ok(pool);
        }
        self.insert(name, params, limits)
    }

    fn insert(
        &self,
        name: &str,
        params: ConnectionParams,
        limits: PoolConfig,
    ) -> Result<ResourcePool, RegistryError> {
        let _registering = self.registering.lock();
        if let Some(pool) = self.pool(name) {
            return Ok(pool);
        }
        // Driver code runs without the map lock, so lookups of other pools are never stalled.
        let factory = self
            .drivers
            .get(&params.driver)
            .ok_or_else(|| RegistryError::UnknownDriver(params.driver.clone()))?;
        let adapter =
            factory
                .create(&params)
                .map_err(|source| RegistryError::Registration {
                    name: name.to_owned(),
                    source,
                })?;
        let pool = ResourcePool::new(name, params, adapter, limits);
        info!(
            pool = %name,
            driver = %pool.params().driver,
            mode = ?pool.mode(),
            "registered connection pool"
        );
        self.pools.write().insert(name.to_owned(), pool.clone());
        Ok(pool)
    }

    /// Acquire a connection from a named pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool cannot be registered, or if acquisition fails.
    pub fn acquire(&self, name: &str) -> Result<PooledResource, RegistryError> {
        Ok(self.get_or_register(name)?.acquire()?)
    }

    /// Acquire a connection from the default pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool cannot be registered, or if acquisition fails.
    pub fn acquire_default(&self) -> Result<PooledResource, RegistryError> {
        self.acquire(&self.config.default_pool)
    }

    /// Acquire a connection from an ad hoc pool identified by its connection parameters.
    ///
    /// The pool is registered on first use with global limits, under a name made of URL and
    /// user name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool cannot be registered, or if acquisition fails.
    #[deprecated(note = "configure a named pool and use `acquire` instead")]
    pub fn acquire_with(
        &self,
        driver: &str,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<PooledResource, RegistryError> {
        let name = format!("{url}{username}");
        let pool = match self.pool(&name) {
            Some(pool) => pool,
            None => self.insert(
                &name,
                ConnectionParams::new(driver, url, username, password),
                self.config.default_limits(),
            )?,
        };
        Ok(pool.acquire()?)
    }

    /// Return a connection to its pool.
    ///
    /// `None` is accepted and ignored. A connection whose pool is not tracked by this registry
    /// is ignored as well, and goes back to its own pool when dropped.
    pub fn release(&self, resource: Option<PooledResource>) {
        let Some(resource) = resource else {
            return;
        };
        let pool = self
            .pool(resource.pool_name())
            .filter(|pool| pool.owns(&resource));
        match pool {
            Some(pool) => {
                if let Err(err) = pool.release(resource) {
                    warn!(pool = %pool.name(), %err, "unable to release connection");
                }
            }
            None => {
                debug!(
                    pool = %resource.pool_name(),
                    "ignoring connection from a pool not tracked by this registry"
                );
            }
        }
    }

    /// Database adapter of a named pool, registering the pool if needed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool cannot be registered.
    pub fn adapter(&self, name: &str) -> Result<Arc<dyn DatabaseAdapter>, RegistryError> {
        Ok(self.get_or_register(name)?.adapter())
    }

    /// Database adapter of the default pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool cannot be registered.
    pub fn adapter_default(&self) -> Result<Arc<dyn DatabaseAdapter>, RegistryError> {
        self.adapter(&self.config.default_pool)
    }

    /// Names of registered pools, in sorted order.
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Occupancy of every registered pool.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, PoolState> {
        self.pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.state()))
            .collect()
    }

    /// Start background tasks enabled in configuration.
    ///
    /// The monitor runs if [`DatabaseConfig::log_interval`] is non-zero, the reaper runs if
    /// [`DatabaseConfig::checkout_timeout`] is set. Tasks already running are left alone.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any task has to be started outside of a Tokio runtime.
    pub fn start_monitor(&self) -> Result<(), RegistryError> {
        let log_interval = Some(self.config.log_interval).filter(|d| !d.is_zero());
        let checkout_timeout = self.config.checkout_timeout.filter(|d| !d.is_zero());
        if log_interval.is_none() && checkout_timeout.is_none() {
            return Ok(());
        }
        let runtime = Handle::try_current()?;
        if let Some(period) = log_interval {
            let mut monitor = self.monitor.lock();
            if monitor.is_none() {
                info!(interval = ?period, "starting pool monitor");
                *monitor = Some(Monitor::reporter(&runtime, self.pools.clone(), period));
            }
        }
        if let Some(max_checkout) = checkout_timeout {
            let mut reaper = self.reaper.lock();
            if reaper.is_none() {
                info!(max_checkout = ?max_checkout, "starting abandoned connection reaper");
                *reaper = Some(Monitor::reaper(&runtime, self.pools.clone(), max_checkout));
            }
        }
        Ok(())
    }

    /// Restart the monitor with a new interval.
    ///
    /// A zero interval stops the monitor. Returns whether the monitor is running afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a non-zero interval is requested outside of a Tokio runtime.
    pub fn reconfigure_monitor(&self, interval: Duration) -> Result<bool, RegistryError> {
        let mut monitor = self.monitor.lock();
        if let Some(previous) = monitor.take() {
            previous.stop();
        }
        if interval.is_zero() {
            info!("pool monitor stopped");
            return Ok(false);
        }
        let runtime = Handle::try_current()?;
        info!(interval = ?interval, "restarting pool monitor");
        *monitor = Some(Monitor::reporter(&runtime, self.pools.clone(), interval));
        Ok(true)
    }

    /// Interval of the running monitor, if any.
    #[must_use]
    pub fn monitor_interval(&self) -> Option<Duration> {
        self.monitor
            .lock()
            .as_ref()
            .filter(|monitor| monitor.is_running())
            .map(Monitor::period)
    }

    /// Stop background tasks and shut down every pool.
    ///
    /// Idle connections are closed right away, checked out connections are closed as they are
    /// returned. Further acquisitions fail.
    pub fn shutdown(&self) {
        let tasks = [self.monitor.lock().take(), self.reaper.lock().take()];
        for task in tasks.into_iter().flatten() {
            task.stop();
        }
        let pools: Vec<ResourcePool> = self.pools.read().values().cloned().collect();
        for pool in &pools {
            pool.shutdown();
        }
        info!(pools = pools.len(), "pool registry shut down");
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("pools", &self.pool_names())
            .field("monitor", &self.monitor_interval())
            .finish_non_exhaustive()
    }
}
