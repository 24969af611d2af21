#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(missing_docs)]

mod config;
mod drivers;
mod errors;
pub mod logging;
mod monitor;
mod registry;
mod util;

pub use poolbroker_pools::{
    adapter, AdapterError, ConnectionHandle, ConnectionParams, DatabaseAdapter, Error as PoolError,
    PoolConfig, PoolMode, PoolState, PooledResource, ResourcePool,
};

pub use self::{
    config::{BrokerConfig, BrokerConfigBuilder, ConfigError, DatabaseConfig, PoolEntry},
    drivers::{AdapterFactory, DriverRegistry},
    errors::RegistryError,
    logging::{LoggingConfig, LoggingError},
    registry::PoolRegistry,
};
