//! Broker configuration structures.

use std::{collections::BTreeMap, fmt, time::Duration};

use poolbroker_pools::{ConnectionParams, PoolConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::logging::LoggingConfig;

/// Root container for broker configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct BrokerConfig {
    /// Connection pool configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Create builder for broker configuration.
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }
}

/// Top-level configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration builder error
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Builder for broker configuration.
#[must_use]
pub struct BrokerConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl BrokerConfigBuilder {
    /// Alternative method to construct a broker configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<BrokerConfig, ConfigError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of broker configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of broker configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add inline YAML document as a source of broker configuration.
    pub fn with_yaml_str(self, yaml: impl AsRef<str>) -> Self {
        self.with_source(config::File::from_str(
            yaml.as_ref(),
            config::FileFormat::Yaml,
        ))
    }

    /// Add environment variables as a source of broker configuration.
    ///
    /// Path segments are separated by double underscores, so with prefix `BROKER` the variable
    /// `BROKER__DATABASE__MAX_CONNECTIONS` sets `database.max_connections`, and
    /// `BROKER__DATABASE__MAIN__URL` sets the URL of pool `main`. Values that look like numbers or
    /// booleans are parsed as such.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(env_source(prefix.as_ref()))
    }
}

fn env_source(prefix: &str) -> config::Environment {
    config::Environment::with_prefix(prefix)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl Default for BrokerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BrokerConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfigBuilder").finish_non_exhaustive()
    }
}

/// Connection pool configuration, the `database` section.
///
/// Global limits apply to every pool unless overridden in that pool's own entry. Every key not
/// listed here is the name of a pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct DatabaseConfig {
    /// Name of the pool used by [`PoolRegistry::acquire_default`].
    ///
    /// Default is `default`.
    ///
    /// [`PoolRegistry::acquire_default`]: crate::PoolRegistry::acquire_default
    #[serde(default = "DatabaseConfig::default_pool_name", alias = "defaultPool")]
    pub default_pool: String,
    /// Maximum number of connections per pool.
    ///
    /// Default is 10.
    #[serde(
        default = "DatabaseConfig::default_max_connections",
        alias = "maxConnections"
    )]
    pub max_connections: usize,
    /// Age after which a connection is retired.
    ///
    /// Default is 1 hour.
    #[serde(
        default = "DatabaseConfig::default_expiry_time",
        with = "humantime_serde",
        alias = "expiryTime"
    )]
    pub expiry_time: Duration,
    /// Consecutive waiting acquisitions after which a pool logs an exhaustion warning.
    ///
    /// Default is 50.
    #[serde(
        default = "DatabaseConfig::default_max_connection_attempts",
        alias = "maxConnectionAttempts"
    )]
    pub max_connection_attempts: u64,
    /// How long an acquisition waits for a connection to be returned.
    ///
    /// Default is 10 seconds.
    #[serde(
        default = "DatabaseConfig::default_connection_wait_timeout",
        with = "humantime_serde",
        alias = "connectionWaitTimeout"
    )]
    pub connection_wait_timeout: Duration,
    /// Interval between pool utilization reports.
    ///
    /// Zero disables the monitor. Default is zero.
    #[serde(default, with = "humantime_serde", alias = "logInterval")]
    pub log_interval: Duration,
    /// Checkouts held longer than this are reclaimed.
    ///
    /// Unset by default, which disables the reaper.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde",
        alias = "checkoutTimeout"
    )]
    pub checkout_timeout: Option<Duration>,
    /// Per-pool settings, keyed by pool name.
    #[serde(flatten)]
    pub pools: BTreeMap<String, PoolEntry>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_pool: Self::default_pool_name(),
            max_connections: Self::default_max_connections(),
            expiry_time: Self::default_expiry_time(),
            max_connection_attempts: Self::default_max_connection_attempts(),
            connection_wait_timeout: Self::default_connection_wait_timeout(),
            log_interval: Duration::ZERO,
            checkout_timeout: None,
            pools: BTreeMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Default value for [`Self::default_pool`].
    #[must_use]
    #[inline]
    fn default_pool_name() -> String {
        "default".into()
    }

    /// Default value for [`Self::max_connections`].
    #[must_use]
    #[inline]
    fn default_max_connections() -> usize {
        PoolConfig::DEFAULT_MAX_CONNECTIONS
    }

    /// Default value for [`Self::expiry_time`].
    #[must_use]
    #[inline]
    fn default_expiry_time() -> Duration {
        PoolConfig::DEFAULT_EXPIRY_TIME
    }

    /// Default value for [`Self::max_connection_attempts`].
    #[must_use]
    #[inline]
    fn default_max_connection_attempts() -> u64 {
        PoolConfig::DEFAULT_MAX_CONNECTION_ATTEMPTS
    }

    /// Default value for [`Self::connection_wait_timeout`].
    #[must_use]
    #[inline]
    fn default_connection_wait_timeout() -> Duration {
        PoolConfig::DEFAULT_CONNECTION_WAIT_TIMEOUT
    }

    /// Add or replace a pool entry.
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, entry: PoolEntry) -> Self {
        self.pools.insert(name.into(), entry);
        self
    }

    /// Settings of a single pool.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&PoolEntry> {
        self.pools.get(name)
    }

    /// Global pool limits, without any per-pool overrides.
    #[must_use]
    pub fn default_limits(&self) -> PoolConfig {
        PoolConfig::default()
            .with_max_connections(self.max_connections)
            .with_expiry_time(self.expiry_time)
            .with_max_connection_attempts(self.max_connection_attempts)
            .with_connection_wait_timeout(self.connection_wait_timeout)
    }

    /// Pool limits for a named pool, global values overlaid with that pool's overrides.
    #[must_use]
    pub fn pool_config(&self, name: &str) -> PoolConfig {
        let limits = self.default_limits();
        match self.pools.get(name) {
            Some(entry) => entry.apply(limits),
            None => limits,
        }
    }
}

/// Settings of a single pool.
#[derive(Clone, Default, Deserialize, PartialEq, Serialize, Zeroize, ZeroizeOnDrop)]
#[non_exhaustive]
pub struct PoolEntry {
    /// Driver identifier, as registered in [`DriverRegistry`](crate::DriverRegistry).
    pub driver: String,
    /// Database URL.
    pub url: String,
    /// User name.
    #[serde(default)]
    pub username: String,
    /// User password.
    #[serde(default)]
    pub password: String,
    /// Override for [`DatabaseConfig::max_connections`].
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "maxConnections"
    )]
    pub max_connections: Option<usize>,
    /// Override for [`DatabaseConfig::expiry_time`].
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde",
        alias = "expiryTime"
    )]
    #[zeroize(skip)]
    pub expiry_time: Option<Duration>,
    /// Override for [`DatabaseConfig::max_connection_attempts`].
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "maxConnectionAttempts"
    )]
    pub max_connection_attempts: Option<u64>,
    /// Override for [`DatabaseConfig::connection_wait_timeout`].
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde",
        alias = "connectionWaitTimeout"
    )]
    #[zeroize(skip)]
    pub connection_wait_timeout: Option<Duration>,
}

impl PoolEntry {
    /// Create pool settings with no limit overrides.
    pub fn new(driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            username: String::new(),
            password: String::new(),
            max_connections: None,
            expiry_time: None,
            max_connection_attempts: None,
            connection_wait_timeout: None,
        }
    }

    /// Set user name and password.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Override maximum number of connections.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// Override connection expiry time.
    #[must_use]
    pub fn with_expiry_time(mut self, expiry_time: Duration) -> Self {
        self.expiry_time = Some(expiry_time);
        self
    }

    /// Override acquisition wait timeout.
    #[must_use]
    pub fn with_connection_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_wait_timeout = Some(timeout);
        self
    }

    /// Connection parameters described by this entry.
    #[must_use]
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams::new(
            self.driver.as_str(),
            self.url.as_str(),
            self.username.as_str(),
            self.password.as_str(),
        )
    }

    /// Overlay overrides from this entry on top of `limits`.
    #[must_use]
    pub fn apply(&self, mut limits: PoolConfig) -> PoolConfig {
        if let Some(max_connections) = self.max_connections {
            limits = limits.with_max_connections(max_connections);
        }
        if let Some(expiry_time) = self.expiry_time {
            limits = limits.with_expiry_time(expiry_time);
        }
        if let Some(attempts) = self.max_connection_attempts {
            limits = limits.with_max_connection_attempts(attempts);
        }
        if let Some(timeout) = self.connection_wait_timeout {
            limits = limits.with_connection_wait_timeout(timeout);
        }
        limits
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("expiry_time", &self.expiry_time)
            .field("max_connection_attempts", &self.max_connection_attempts)
            .field("connection_wait_timeout", &self.connection_wait_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database:
  default_pool: main
  max_connections: 4
  expiry_time: 30m
  connection_wait_timeout: 250ms
  log_interval: 5s
  main:
    driver: mock
    url: mock://localhost/main
    username: app
    password: hunter2
    max_connections: 2
  reports:
    driver: mock
    url: mock://localhost/reports
    expiry_time: 10s
"#;

    #[test]
    fn defaults_without_sources() {
        let config = BrokerConfig::builder().build().unwrap();
        let db = &config.database;
        assert_eq!(db.default_pool, "default");
        assert_eq!(db.max_connections, 10);
        assert_eq!(db.expiry_time, Duration::from_secs(3600));
        assert_eq!(db.max_connection_attempts, 50);
        assert_eq!(db.connection_wait_timeout, Duration::from_secs(10));
        assert_eq!(db.log_interval, Duration::ZERO);
        assert_eq!(db.checkout_timeout, None);
        assert!(db.pools.is_empty());
        assert_eq!(db.default_limits(), PoolConfig::default());
    }

    fn env_vars(vars: &[(&str, &str)]) -> config::Environment {
        let vars = vars
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        env_source("BROKER").source(Some(vars))
    }

    #[test]
    fn environment_overrides_file() {
        let config = BrokerConfig::builder()
            .with_yaml_str(SAMPLE)
            .with_source(env_vars(&[
                ("BROKER__DATABASE__MAX_CONNECTIONS", "7"),
                ("BROKER__DATABASE__CONNECTION_WAIT_TIMEOUT", "3s"),
                ("BROKER__DATABASE__MAIN__MAX_CONNECTIONS", "5"),
                ("BROKER__DATABASE__MAIN__URL", "mock://replica/main"),
                ("OTHER__DATABASE__MAX_CONNECTIONS", "99"),
            ]))
            .build()
            .unwrap();
        let db = &config.database;
        assert_eq!(db.max_connections, 7);
        assert_eq!(db.connection_wait_timeout, Duration::from_secs(3));
        assert_eq!(db.default_pool, "main");
        let main = db.pool("main").unwrap();
        assert_eq!(main.url, "mock://replica/main");
        assert_eq!(main.password.as_str(), "hunter2");
        assert_eq!(db.pool_config("main").max_connections, 5);
        assert_eq!(db.pool_config("reports").max_connections, 7);
    }

    #[test]
    fn environment_alone_defines_pool() {
        let config = BrokerConfig::builder()
            .with_source(env_vars(&[
                ("BROKER__DATABASE__DEFAULT_POOL", "orders"),
                ("BROKER__DATABASE__ORDERS__DRIVER", "mock"),
                ("BROKER__DATABASE__ORDERS__URL", "mock://localhost/orders"),
            ]))
            .build()
            .unwrap();
        let db = &config.database;
        assert_eq!(db.default_pool, "orders");
        assert_eq!(db.pool("orders").unwrap().driver, "mock");
        assert_eq!(db.max_connections, PoolConfig::DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn per_pool_overrides() {
        let config = BrokerConfig::builder()
            .with_yaml_str(SAMPLE)
            .build()
            .unwrap();
        let db = &config.database;
        assert_eq!(db.default_pool, "main");
        assert_eq!(db.log_interval, Duration::from_secs(5));
        assert_eq!(db.pools.len(), 2);

        let main = db.pool_config("main");
        assert_eq!(main.max_connections, 2);
        assert_eq!(main.expiry_time, Duration::from_secs(30 * 60));
        assert_eq!(main.connection_wait_timeout, Duration::from_millis(250));

        let reports = db.pool_config("reports");
        assert_eq!(reports.max_connections, 4);
        assert_eq!(reports.expiry_time, Duration::from_secs(10));

        let params = db.pool("main").unwrap().params();
        assert_eq!(params.driver, "mock");
        assert_eq!(params.username, "app");
        assert_eq!(params.password.as_str(), "hunter2");
        assert!(db.pool("reports").unwrap().username.is_empty());
    }

    #[test]
    fn unknown_pool_gets_global_limits() {
        let db = DatabaseConfig {
            max_connections: 3,
            ..DatabaseConfig::default()
        };
        assert_eq!(db.pool_config("missing").max_connections, 3);
    }

    #[test]
    fn pool_entry_debug_hides_password() {
        let entry = PoolEntry::new("mock", "mock://db").with_credentials("scott", "tiger");
        let debug = format!("{entry:?}");
        assert!(debug.contains("scott"));
        assert!(!debug.contains("tiger"));
    }
}
