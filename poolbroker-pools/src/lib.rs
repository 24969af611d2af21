#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

pub mod adapter;
pub mod error;
mod metrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod pool;
mod resource;

pub use crate::{
    adapter::{AdapterError, ConnectionParams, DatabaseAdapter},
    error::Error,
    metrics::PoolState,
    pool::{PoolConfig, PoolMode, ResourcePool},
    resource::{ConnectionHandle, PooledResource},
};
