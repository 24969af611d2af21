//! Background tasks observing connection pools.

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use poolbroker_pools::{PoolState, ResourcePool};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Pools tracked by a registry, keyed by name.
pub(crate) type PoolMap = Arc<RwLock<BTreeMap<String, ResourcePool>>>;

/// Utilization report line for one pool.
pub(crate) fn report_line(name: &str, state: &PoolState) -> String {
    format!("{name}: {} + {} = {}", state.idle, state.in_use, state.size)
}

/// Log utilization of every pool and push it to pool metrics.
pub(crate) fn report(pools: &PoolMap) {
    let pools: Vec<ResourcePool> = pools.read().values().cloned().collect();
    for pool in pools {
        let state = pool.state();
        info!(
            pool = %pool.name(),
            idle = state.idle,
            checked_out = state.in_use,
            total = state.size,
            "{}",
            report_line(pool.name(), &state)
        );
        pool.record_metrics();
    }
}

/// Reclaim checkouts held longer than `max_checkout` in every pool.
pub(crate) fn reclaim(pools: &PoolMap, max_checkout: Duration) -> usize {
    let pools: Vec<ResourcePool> = pools.read().values().cloned().collect();
    pools
        .iter()
        .map(|pool| pool.reclaim_abandoned(max_checkout))
        .sum()
}

/// Periodic background task over registered pools.
///
/// The period is fixed when the task starts. Dropping the handle stops the task.
#[derive(Debug)]
pub(crate) struct Monitor {
    /// Period between runs.
    period: Duration,
    /// Stop signal.
    token: CancellationToken,
    /// Task handle.
    task: JoinHandle<()>,
}

impl Monitor {
    /// Start utilization reporting every `period`.
    pub(crate) fn reporter(runtime: &Handle, pools: PoolMap, period: Duration) -> Self {
        let span = info_span!("pool_monitor", period = ?period);
        Self::spawn(runtime, period, span, move || report(&pools))
    }

    /// Start reclaiming abandoned checkouts, once per `max_checkout`.
    pub(crate) fn reaper(runtime: &Handle, pools: PoolMap, max_checkout: Duration) -> Self {
        let span = info_span!("pool_reaper", max_checkout = ?max_checkout);
        Self::spawn(runtime, max_checkout, span, move || {
            let reclaimed = reclaim(&pools, max_checkout);
            if reclaimed > 0 {
                debug!(reclaimed, "reclaimed abandoned connections");
            }
        })
    }

    fn spawn<F>(runtime: &Handle, period: Duration, span: tracing::Span, tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = runtime.spawn(Self::run(period, token.clone(), tick).instrument(span));
        Self {
            period,
            token,
            task,
        }
    }

    fn run<F>(period: Duration, token: CancellationToken, mut tick: F) -> impl Future<Output = ()>
    where
        F: FnMut() + Send + 'static,
    {
        async move {
            debug!("background task started");
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = timer.tick() => tick(),
                }
            }
            debug!("background task stopped");
        }
    }

    /// Period between runs.
    pub(crate) fn period(&self) -> Duration {
        self.period
    }

    /// Whether the task is still running.
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the task to stop after its current run.
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
