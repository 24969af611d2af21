//! Bounded pool of database connections.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, error, info, warn};

use crate::{
    adapter::{AdapterError, ConnectionParams, DatabaseAdapter, PooledConnectionSource},
    error::Error,
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
    resource::{PooledResource, Resource, ResourceListener},
};

/// Limits of a single pool.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections the pool will hold, idle and checked out combined.
    pub max_connections: usize,
    /// Connections older than this are closed instead of being handed out or pooled.
    pub expiry_time: Duration,
    /// Number of consecutive waiting acquisitions after which a warning is logged.
    ///
    /// Purely advisory, acquisition is never refused because of it.
    pub max_connection_attempts: u64,
    /// How long [`ResourcePool::acquire`] waits for a connection to be returned.
    pub connection_wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            expiry_time: Self::DEFAULT_EXPIRY_TIME,
            max_connection_attempts: Self::DEFAULT_MAX_CONNECTION_ATTEMPTS,
            connection_wait_timeout: Self::DEFAULT_CONNECTION_WAIT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::max_connections`].
    pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
    /// Default value for [`Self::expiry_time`], one hour.
    pub const DEFAULT_EXPIRY_TIME: Duration = Duration::from_secs(3600);
    /// Default value for [`Self::max_connection_attempts`].
    pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u64 = 50;
    /// Default value for [`Self::connection_wait_timeout`], ten seconds.
    pub const DEFAULT_CONNECTION_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Set [`Self::max_connections`].
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set [`Self::expiry_time`].
    #[must_use]
    pub fn with_expiry_time(mut self, expiry_time: Duration) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    /// Set [`Self::max_connection_attempts`].
    #[must_use]
    pub fn with_max_connection_attempts(mut self, attempts: u64) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    /// Set [`Self::connection_wait_timeout`].
    #[must_use]
    pub fn with_connection_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_wait_timeout = timeout;
        self
    }
}

/// How a pool obtains and recycles connections.
///
/// Chosen once, when the pool is constructed, by probing its [`DatabaseAdapter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolMode {
    /// Driver pools physical connections, the pool hands out logical handles.
    Native,
    /// Pool owns one raw connection per pooled resource.
    Manual,
}

/// Connection factory matching [`PoolMode`].
enum Strategy {
    Native(Arc<dyn PooledConnectionSource>),
    Manual,
}

/// Checkout record of a resource.
struct Lease {
    /// Checkout time.
    since: Instant,
    /// Event flags of the checked out resource.
    listener: Arc<ResourceListener>,
}

/// Mutable pool state, guarded by a single mutex.
#[derive(Default)]
struct Slots {
    /// Idle resources, most recently released last.
    idle: Vec<Resource>,
    /// Live resources allocated by this pool, idle and checked out.
    total: usize,
    /// Checked out resources, including slots reserved for connections being opened.
    leases: HashMap<u64, Lease>,
    /// Consecutive acquisitions that had to wait.
    waits: u64,
    /// Pool has been shut down.
    shut_down: bool,
}

/// Outcome of the locked part of acquisition.
enum Slot {
    Reuse(Resource),
    Create(Arc<ResourceListener>),
}

/// State shared between a pool and the resources checked out of it.
pub(crate) struct PoolShared {
    /// Logical pool name.
    name: String,
    /// Connection parameters.
    params: ConnectionParams,
    /// Pool limits.
    config: PoolConfig,
    /// Database adapter.
    adapter: Arc<dyn DatabaseAdapter>,
    /// Connection factory.
    strategy: Strategy,
    /// Pool contents.
    slots: Mutex<Slots>,
    /// Signalled whenever a resource or a capacity slot is given back.
    returned: Condvar,
    /// Next checkout lease identifier.
    next_lease: AtomicU64,
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Pool label.
    label: [KeyValue; 1],
    /// Time of last gathering of pool state metrics.
    last_gathered_at: Mutex<Instant>,
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> PoolMode {
        match self.strategy {
            Strategy::Native(_) => PoolMode::Native,
            Strategy::Manual => PoolMode::Manual,
        }
    }

    fn is_valid(&self, resource: &Resource) -> bool {
        resource.is_open() && !resource.is_expired(self.config.expiry_time)
    }

    fn state(&self) -> PoolState {
        let slots = self.slots.lock();
        PoolState {
            max_size: self.config.max_connections,
            size: slots.total,
            idle: slots.idle.len(),
            in_use: slots.total.saturating_sub(slots.idle.len()),
        }
    }

    fn record_state(&self) {
        *self.last_gathered_at.lock() = Instant::now();
        self.metrics.record_state(&self.label, &self.state());
    }

    fn update_metrics(&self) {
        const PROBE_INTERVAL: Duration = Duration::from_secs(15);
        let mut last_gathered_at = self.last_gathered_at.lock();
        if last_gathered_at.elapsed() > PROBE_INTERVAL {
            *last_gathered_at = Instant::now();
            drop(last_gathered_at);
            self.metrics.record_state(&self.label, &self.state());
        }
    }

    /// Give one unit of capacity back.
    fn decrement(&self, slots: &mut Slots) -> Result<(), Error> {
        match slots.total.checked_sub(1) {
            Some(total) => {
                slots.total = total;
                self.returned.notify_one();
                Ok(())
            }
            None => {
                error!(pool = %self.name, "pool accounting underflow, no live connection to discard");
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Pop idle resources until a valid one is found.
    ///
    /// Invalid resources are moved to `discarded`, to be closed once the lock is released.
    fn pop_valid(
        &self,
        slots: &mut Slots,
        discarded: &mut Vec<Resource>,
    ) -> Result<Option<Resource>, Error> {
        while let Some(resource) = slots.idle.pop() {
            if self.is_valid(&resource) {
                return Ok(Some(resource));
            }
            discarded.push(resource);
            self.decrement(slots)?;
        }
        Ok(None)
    }

    fn checkout(&self, slots: &mut Slots, listener: Arc<ResourceListener>) -> u64 {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        slots.leases.insert(
            lease,
            Lease {
                since: Instant::now(),
                listener,
            },
        );
        lease
    }

    fn new_resource(&self, listener: Arc<ResourceListener>) -> Result<Resource, AdapterError> {
        match &self.strategy {
            Strategy::Native(source) => {
                let physical =
                    source.pooled_connection(&self.params.username, &self.params.password)?;
                Ok(Resource::native(physical, listener))
            }
            Strategy::Manual => Ok(Resource::manual(self.adapter.connect()?, listener)),
        }
    }

    fn acquire(self: &Arc<Self>) -> Result<PooledResource, Error> {
        let deadline = Instant::now() + self.config.connection_wait_timeout;
        let mut discarded = Vec::new();
        let mut waited = false;
        let slot = {
            let mut slots = self.slots.lock();
            loop {
                if slots.shut_down {
                    break Err(Error::ShutDown(self.name.clone()));
                }
                match self.pop_valid(&mut slots, &mut discarded) {
                    Ok(Some(resource)) => {
                        if !waited {
                            slots.waits = 0;
                        }
                        let lease = self.checkout(&mut slots, resource.listener().clone());
                        break Ok((lease, Slot::Reuse(resource)));
                    }
                    Ok(None) => {}
                    Err(err) => break Err(err),
                }
                if slots.total < self.config.max_connections {
                    if !waited {
                        slots.waits = 0;
                    }
                    slots.total += 1;
                    let listener = Arc::new(ResourceListener::new(Arc::downgrade(self)));
                    let lease = self.checkout(&mut slots, listener.clone());
                    break Ok((lease, Slot::Create(listener)));
                }
                if Instant::now() >= deadline {
                    break Err(Error::WaitTimeout {
                        pool: self.name.clone(),
                        url: self.params.url.clone(),
                    });
                }
                if !waited {
                    waited = true;
                    slots.waits += 1;
                    if slots.waits == self.config.max_connection_attempts {
                        warn!(
                            pool = %self.name,
                            attempts = slots.waits,
                            "pool has been exhausted for many consecutive acquisitions"
                        );
                    }
                }
                let _ = self.returned.wait_until(&mut slots, deadline);
            }
        };
        for mut resource in discarded {
            debug!(pool = %self.name, "discarding invalid connection");
            let _ = resource.close();
        }
        let (lease, slot) = slot?;
        let mut resource = match slot {
            Slot::Reuse(resource) => resource,
            Slot::Create(listener) => match self.new_resource(listener) {
                Ok(resource) => {
                    debug!(pool = %self.name, lease, "opened new connection");
                    resource
                }
                Err(err) => {
                    let mut slots = self.slots.lock();
                    if slots.leases.remove(&lease).is_some() {
                        // Slot was reserved above, the counter cannot be zero here.
                        let _ = self.decrement(&mut slots);
                    }
                    return Err(Error::Adapter(err));
                }
            },
        };
        resource.link(lease);
        Ok(PooledResource::new(self.clone(), lease, resource))
    }

    /// Drop idle resources whose driver reported a fatal error.
    pub(crate) fn discard_failed(&self) {
        let failed: Vec<Resource> = {
            let mut slots = self.slots.lock();
            let (failed, healthy): (Vec<_>, Vec<_>) = std::mem::take(&mut slots.idle)
                .into_iter()
                .partition(|resource| resource.listener().is_failed());
            slots.idle = healthy;
            for _ in &failed {
                let _ = self.decrement(&mut slots);
            }
            failed
        };
        for mut resource in failed {
            debug!(pool = %self.name, "discarding failed idle connection");
            resource.force_close();
        }
    }

    /// Take a resource back from a checkout.
    pub(crate) fn release(&self, mut resource: Resource, lease: u64, checked_out_at: Instant) {
        if let Err(err) = resource.unlink(lease) {
            error!(pool = %self.name, lease, %err, "unable to unlink connection");
            return;
        }
        let valid = self.is_valid(&resource);
        let discard = {
            let mut slots = self.slots.lock();
            if slots.leases.remove(&lease).is_none() {
                // Lease was revoked, its capacity has already been given back.
                Some(resource)
            } else if valid && !slots.shut_down {
                slots.idle.push(resource);
                self.returned.notify_one();
                None
            } else {
                let _ = self.decrement(&mut slots);
                Some(resource)
            }
        };
        self.metrics
            .use_time
            .record(checked_out_at.elapsed().as_secs_f64(), &self.label);
        if let Some(mut resource) = discard {
            debug!(pool = %self.name, lease, "closing returned connection");
            let _ = resource.close();
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        for mut resource in self.slots.get_mut().idle.drain(..) {
            let _ = resource.close();
        }
    }
}

/// Bounded pool of reusable connections to one logical database.
///
/// Cloning a pool is cheap, clones share the same connections.
#[derive(Clone)]
pub struct ResourcePool {
    shared: Arc<PoolShared>,
}

impl ResourcePool {
    /// Create a pool, probing `adapter` for driver-native pooling support.
    pub fn new(
        name: impl Into<String>,
        params: ConnectionParams,
        adapter: Arc<dyn DatabaseAdapter>,
        config: PoolConfig,
    ) -> Self {
        let name = name.into();
        let strategy = match adapter.pooled_source() {
            Some(source) => Strategy::Native(source),
            None => Strategy::Manual,
        };
        let shared = Arc::new(PoolShared {
            label: pool_kv(name.clone().into()),
            name,
            params,
            config,
            adapter,
            strategy,
            slots: Mutex::new(Slots::default()),
            returned: Condvar::new(),
            next_lease: AtomicU64::new(1),
            metrics: POOL_METRICS.clone(),
            last_gathered_at: Mutex::new(Instant::now()),
        });
        debug!(
            pool = %shared.name,
            url = %shared.params.url,
            mode = ?shared.mode(),
            max_connections = shared.config.max_connections,
            "created connection pool"
        );
        shared.record_state();
        Self { shared }
    }

    /// Logical pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Connection parameters.
    #[must_use]
    pub fn params(&self) -> &ConnectionParams {
        &self.shared.params
    }

    /// Pool limits.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Operating mode chosen at construction.
    #[must_use]
    pub fn mode(&self) -> PoolMode {
        self.shared.mode()
    }

    /// Database adapter associated with this pool.
    #[must_use]
    pub fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        self.shared.adapter.clone()
    }

    /// Whether both handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether `resource` was checked out of this pool.
    #[must_use]
    pub fn owns(&self, resource: &PooledResource) -> bool {
        Arc::ptr_eq(&self.shared, resource.pool())
    }

    /// Acquire a connection.
    ///
    /// Reuses the most recently released valid connection, or opens a new one while the pool is
    /// below its limit. Otherwise blocks the calling thread for up to
    /// [`PoolConfig::connection_wait_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitTimeout`] if nothing became available in time, [`Error::ShutDown`]
    /// after [`Self::shutdown`], or [`Error::Adapter`] if a new connection could not be opened.
    pub fn acquire(&self) -> Result<PooledResource, Error> {
        let now = Instant::now();
        let span = debug_span!("pool_acquire", pool = %self.shared.name).entered();
        let result = self.shared.acquire();
        drop(span);
        match &result {
            Ok(_) => {
                self.shared
                    .metrics
                    .wait_time
                    .record(now.elapsed().as_secs_f64(), &self.shared.label);
                self.shared.update_metrics();
            }
            Err(err) if err.is_timeout() => {
                debug!(pool = %self.shared.name, "timed out waiting for a connection");
                self.shared.metrics.timeouts.add(1, &self.shared.label);
            }
            Err(_) => {}
        }
        result
    }

    /// Return a connection to this pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPool`] if `resource` belongs to another pool. That resource is then
    /// returned to its own pool as it goes out of scope.
    pub fn release(&self, mut resource: PooledResource) -> Result<(), Error> {
        if !self.owns(&resource) {
            return Err(Error::WrongPool);
        }
        resource.release();
        Ok(())
    }

    /// Current occupancy.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    /// Push current occupancy to pool metrics.
    pub fn record_metrics(&self) {
        self.shared.record_state();
    }

    /// Whether [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.slots.lock().shut_down
    }

    /// Close all idle connections and refuse further acquisitions.
    ///
    /// Connections still checked out are closed as they are returned.
    pub fn shutdown(&self) {
        let idle = {
            let mut slots = self.shared.slots.lock();
            slots.shut_down = true;
            let idle: Vec<_> = slots.idle.drain(..).collect();
            slots.total = slots.total.saturating_sub(idle.len());
            self.shared.returned.notify_all();
            idle
        };
        info!(pool = %self.shared.name, closed = idle.len(), "shutting down connection pool");
        for mut resource in idle {
            let _ = resource.close();
        }
        self.shared.record_state();
    }

    /// Revoke leases checked out for longer than `max_checkout`.
    ///
    /// Capacity held by revoked leases is given back immediately. The connections themselves are
    /// closed as soon as their holders touch or drop them. Returns the number of revoked leases.
    pub fn reclaim_abandoned(&self, max_checkout: Duration) -> usize {
        let revoked = {
            let mut slots = self.shared.slots.lock();
            let expired: Vec<u64> = slots
                .leases
                .iter()
                .filter(|(_, lease)| lease.since.elapsed() > max_checkout)
                .map(|(id, _)| *id)
                .collect();
            let mut revoked = Vec::with_capacity(expired.len());
            for id in expired {
                if let Some(lease) = slots.leases.remove(&id) {
                    lease.listener.revoke();
                    if self.shared.decrement(&mut slots).is_err() {
                        break;
                    }
                    revoked.push((id, lease.since.elapsed()));
                }
            }
            revoked
        };
        for (lease, held) in &revoked {
            warn!(
                pool = %self.shared.name,
                lease,
                held_for = ?held,
                "connection was not returned to its pool, reclaiming"
            );
        }
        revoked.len()
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.shared.name)
            .field("params", &self.shared.params)
            .field("mode", &self.shared.mode())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, thread};

    use super::*;
    use crate::mock::MockDriver;

    const EXHAUSTED: &str = "pool has been exhausted for many consecutive acquisitions";

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn count(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn make_pool(driver: &MockDriver, config: PoolConfig) -> ResourcePool {
        ResourcePool::new(
            "test",
            ConnectionParams::new("mock", "mock://localhost/test", "user", "secret"),
            Arc::new(driver.clone()),
            config,
        )
    }

    fn assert_consistent(state: PoolState) {
        assert_eq!(state.idle + state.in_use, state.size, "{state:?}");
        assert!(state.size <= state.max_size, "{state:?}");
    }

    #[test]
    fn probes_adapter_for_mode() {
        let manual = make_pool(&MockDriver::manual(), PoolConfig::default());
        assert_eq!(manual.mode(), PoolMode::Manual);
        let native = make_pool(&MockDriver::native(), PoolConfig::default());
        assert_eq!(native.mode(), PoolMode::Native);
    }

    #[test]
    fn acquire_from_empty_pool_creates_one_connection() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default());
        let conn = pool.acquire().unwrap();
        assert_eq!(driver.opened(), 1);
        assert_eq!(
            pool.state(),
            PoolState {
                max_size: PoolConfig::DEFAULT_MAX_CONNECTIONS,
                size: 1,
                idle: 0,
                in_use: 1,
            }
        );
        drop(conn);
        assert_consistent(pool.state());
    }

    #[test]
    fn acquire_release_cycle_keeps_counts() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default());
        drop(pool.acquire().unwrap());
        let before = pool.state();
        let mut conn = pool.acquire().unwrap();
        conn.release();
        assert_eq!(pool.state(), before);
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.closed(), 0);
    }

    #[test]
    fn most_recently_released_is_reused_first() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default());
        let mut older = pool.acquire().unwrap();
        thread::sleep(Duration::from_millis(2));
        let mut newer = pool.acquire().unwrap();
        let newer_created = newer.created_at();
        older.release();
        newer.release();
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.created_at(), newer_created);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(2)
                .with_expiry_time(Duration::from_secs(100))
                .with_connection_wait_timeout(Duration::from_millis(50)),
        );
        let _first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();
        assert_eq!(pool.state().size, 2);
        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, Error::WaitTimeout { ref pool, .. } if pool == "test"));
        assert!(err.is_timeout());
        assert_eq!(pool.state().size, 2);
        assert_eq!(driver.opened(), 2);
    }

    #[test]
    fn zero_wait_timeout_fails_immediately() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(1)
                .with_connection_wait_timeout(Duration::ZERO),
        );
        let _held = pool.acquire().unwrap();
        assert!(pool.acquire().unwrap_err().is_timeout());
    }

    #[test]
    fn warns_once_consecutive_waits_reach_limit() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(1)
                .with_max_connection_attempts(3)
                .with_connection_wait_timeout(Duration::from_millis(5)),
        );
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut held = pool.acquire().unwrap();
            for _ in 0..2 {
                assert!(pool.acquire().unwrap_err().is_timeout());
            }
            assert_eq!(capture.count(EXHAUSTED), 0);
            assert!(pool.acquire().unwrap_err().is_timeout());
            assert_eq!(capture.count(EXHAUSTED), 1);
            for _ in 0..3 {
                assert!(pool.acquire().unwrap_err().is_timeout());
            }
            assert_eq!(capture.count(EXHAUSTED), 1);

            // An acquisition served without waiting starts the count over.
            held.release();
            let _held = pool.acquire().unwrap();
            for _ in 0..2 {
                assert!(pool.acquire().unwrap_err().is_timeout());
            }
            assert_eq!(capture.count(EXHAUSTED), 1);
            assert!(pool.acquire().unwrap_err().is_timeout());
            assert_eq!(capture.count(EXHAUSTED), 2);
        });
    }

    #[test]
    fn new_connection_resets_wait_count() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(1)
                .with_max_connection_attempts(2)
                .with_expiry_time(Duration::from_millis(20))
                .with_connection_wait_timeout(Duration::from_millis(5)),
        );
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut held = pool.acquire().unwrap();
            assert!(pool.acquire().unwrap_err().is_timeout());
            thread::sleep(Duration::from_millis(30));
            // Expired on release, so the next acquisition opens a new connection.
            held.release();
            let _held = pool.acquire().unwrap();
            assert_eq!(driver.opened(), 2);
            assert!(pool.acquire().unwrap_err().is_timeout());
            assert_eq!(capture.count(EXHAUSTED), 0);
            assert!(pool.acquire().unwrap_err().is_timeout());
            assert_eq!(capture.count(EXHAUSTED), 1);
        });
    }

    #[test]
    fn blocked_acquire_gets_released_connection() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(2)
                .with_expiry_time(Duration::from_secs(100))
                .with_connection_wait_timeout(Duration::from_secs(5)),
        );
        let _first = pool.acquire().unwrap();
        let mut second = pool.acquire().unwrap();
        let second_created = second.created_at();
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire());
            thread::sleep(Duration::from_millis(20));
            second.release();
            let third = waiter.join().unwrap().unwrap();
            assert_eq!(third.created_at(), second_created);
        });
        assert_eq!(driver.opened(), 2);
        assert_consistent(pool.state());
    }

    #[test]
    fn discarded_connection_wakes_waiter() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(1)
                .with_expiry_time(Duration::from_millis(10))
                .with_connection_wait_timeout(Duration::from_secs(5)),
        );
        let mut held = pool.acquire().unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire());
            thread::sleep(Duration::from_millis(30));
            // Expired by now, so the slot is freed instead of restocked.
            held.release();
            let conn = waiter.join().unwrap().unwrap();
            assert!(conn.age().unwrap() < Duration::from_millis(30));
        });
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
    }

    #[test]
    fn expired_connection_is_closed_on_release() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default().with_expiry_time(Duration::from_millis(20)),
        );
        let mut conn = pool.acquire().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(pool.state().size, 1);
        conn.release();
        assert_eq!(pool.state().size, 0);
        assert_eq!(pool.state().idle, 0);
        assert_eq!(driver.closed(), 1);
    }

    #[test]
    fn expired_idle_connection_is_replaced() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default().with_expiry_time(Duration::from_millis(20)),
        );
        drop(pool.acquire().unwrap());
        thread::sleep(Duration::from_millis(40));
        let _conn = pool.acquire().unwrap();
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.state().size, 1);
    }

    #[test]
    fn failed_connect_gives_slot_back() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default().with_max_connections(1));
        driver.refuse_connections(true);
        assert!(matches!(pool.acquire(), Err(Error::Adapter(_))));
        assert_eq!(pool.state().size, 0);
        driver.refuse_connections(false);
        let _conn = pool.acquire().unwrap();
        assert_eq!(pool.state().size, 1);
    }

    #[test]
    fn release_to_foreign_pool_is_rejected() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default());
        let other = make_pool(&driver, PoolConfig::default());
        let conn = pool.acquire().unwrap();
        assert!(matches!(other.release(conn), Err(Error::WrongPool)));
        // The rejected connection still finds its way home.
        assert_eq!(pool.state().idle, 1);
        assert_eq!(other.state().size, 0);
    }

    #[test]
    fn shutdown_closes_idle_and_returned_connections() {
        let driver = MockDriver::manual();
        let pool = make_pool(&driver, PoolConfig::default());
        let idle = pool.acquire().unwrap();
        let held = pool.acquire().unwrap();
        drop(idle);
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(driver.closed(), 1);
        assert!(matches!(pool.acquire(), Err(Error::ShutDown(_))));
        drop(held);
        assert_eq!(driver.closed(), 2);
        assert_eq!(pool.state().size, 0);
    }

    #[test]
    fn abandoned_checkout_is_reclaimed() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(1)
                .with_connection_wait_timeout(Duration::ZERO),
        );
        let mut abandoned = pool.acquire().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.reclaim_abandoned(Duration::from_secs(60)), 0);
        assert_eq!(pool.reclaim_abandoned(Duration::from_millis(10)), 1);
        assert_eq!(pool.state().size, 0);
        let _fresh = pool.acquire().unwrap();
        assert!(matches!(abandoned.handle(), Err(Error::Revoked)));
        assert_eq!(driver.closed(), 1);
        drop(abandoned);
        assert_eq!(pool.state().size, 1);
        assert_eq!(pool.state().in_use, 1);
    }

    #[test]
    fn concurrent_use_keeps_invariants() {
        let driver = MockDriver::manual();
        let pool = make_pool(
            &driver,
            PoolConfig::default()
                .with_max_connections(3)
                .with_connection_wait_timeout(Duration::from_secs(5)),
        );
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let mut conn = pool.acquire().unwrap();
                        conn.commit().unwrap();
                        assert_consistent(pool.state());
                        conn.release();
                    }
                });
            }
        });
        let state = pool.state();
        assert_consistent(state);
        assert_eq!(state.in_use, 0);
        assert!(driver.opened() <= 3);
        assert_eq!(driver.live(), state.size);
    }

    #[test]
    fn native_pool_recycles_physical_connections() {
        let driver = MockDriver::native();
        let pool = make_pool(&driver, PoolConfig::default());
        let mut conn = pool.acquire().unwrap();
        assert_eq!(driver.handles(), 1);
        conn.set_auto_commit(false).unwrap();
        conn.commit().unwrap();
        conn.rollback().unwrap();
        conn.release();
        assert!(conn.commit().is_err());
        assert_eq!(driver.commits(), 1);
        assert_eq!(driver.rollbacks(), 1);
        let physical = driver.physical(0).unwrap();
        assert!(!physical.is_closed());
        assert_eq!(pool.state().idle, 1);
        let _again = pool.acquire().unwrap();
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.handles(), 2);
    }
}
