//! Periodic eviction of expired idle sessions.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{PoolError, Result};
use crate::lifecycle::SessionFactory;
use crate::pool::Pool;

/// Default interval between eviction sweeps.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that sweeps pools on a fixed interval.
///
/// Each sweep closes idle sessions past their expiration timeout and tops
/// pools back up to their minimum size. The task is aborted when the
/// scheduler is dropped.
#[derive(Debug)]
pub struct EvictionScheduler {
    handle: JoinHandle<()>,
    interval: Duration,
}

impl EvictionScheduler {
    /// Spawn a sweep over the pools returned by `pools`.
    ///
    /// `pools` is called on every tick; returning `None` stops the task.
    /// Fails if `interval` is zero or no Tokio runtime is running.
    pub fn spawn<F, P>(interval: Duration, pools: P) -> Result<Self>
    where
        F: SessionFactory,
        P: Fn() -> Option<Vec<Pool<F>>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(PoolError::Configuration(
                "eviction interval must be greater than 0".into(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Configuration("eviction scheduler requires a Tokio runtime".into())
        })?;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(pools) = pools() else {
                    tracing::debug!("eviction source dropped, stopping sweeps");
                    break;
                };
                let mut evicted = 0;
                for pool in &pools {
                    evicted += pool.evict_expired().await;
                }
                tracing::trace!(pools = pools.len(), evicted, "eviction sweep finished");
            }
        });

        tracing::debug!(?interval, "eviction scheduler started");
        Ok(Self { handle, interval })
    }

    /// Sweep a single pool for as long as it is alive.
    pub fn for_pool<F: SessionFactory>(pool: &Pool<F>, interval: Duration) -> Result<Self> {
        let weak = pool.downgrade();
        Self::spawn(interval, move || weak.upgrade().map(|pool| vec![pool]))
    }

    /// Interval between sweeps.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the sweep task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
