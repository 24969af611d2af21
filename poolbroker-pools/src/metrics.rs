use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton shared by all pools.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of connections that are currently in state described by the state attribute.
    pub(crate) conn_count: Gauge<u64>,
    /// The maximum number of open connections allowed.
    pub(crate) conn_max: Gauge<u64>,
    /// The time it took to obtain an open connection from the pool.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between borrowing a connection and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
    /// The number of connection timeouts that have occurred trying to obtain a connection.
    pub(crate) timeouts: Counter<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    pub(crate) fn new() -> Self {
        let meter = global::meter("poolbroker-pools");
        // Every instrument carries the pool name, connection counts also carry the state.
        let conn_count = meter
            .u64_gauge("db.client.connection.count")
            .with_description("The number of connections that are currently in state described by the state attribute.")
            .build();
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of open connections allowed.")
            .build();
        let wait_time = meter
            .f64_histogram("db.client.connection.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain an open connection from the pool.")
            .build();
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description(
                "The time between borrowing a connection and returning it to the pool.",
            )
            .build();
        let timeouts = meter
            .u64_counter("db.client.connection.timeouts")
            .with_description("The number of connection timeouts that have occurred trying to obtain a connection from the pool.")
            .build();
        Metrics {
            conn_count,
            conn_max,
            wait_time,
            use_time,
            timeouts,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue; 1], state: &PoolState) {
        self.conn_max.record(state.max_size as u64, label);
        let total_label = status_kv(label[0].clone(), "total");
        self.conn_count.record(state.size as u64, &total_label);
        let idle_label = status_kv(label[0].clone(), "idle");
        self.conn_count.record(state.idle as u64, &idle_label);
        let used_label = status_kv(label[0].clone(), "used");
        self.conn_count.record(state.in_use as u64, &used_label);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

pub(crate) fn pool_kv(name: Cow<'static, str>) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name)]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Snapshot of pool occupancy.
///
/// `idle + in_use == size <= max_size` holds for every snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Maximum total (`idle` + `in_use`) number of connections in the pool.
    pub max_size: usize,
    /// Current total (`idle` + `in_use`) number of connections in the pool.
    pub size: usize,
    /// Current number of idle (not checked out) connections.
    pub idle: usize,
    /// Current number of checked out connections.
    pub in_use: usize,
}
