//! Pool status and metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle sessions available.
    pub idle: u32,
    /// Number of sessions currently checked out.
    pub in_use: u32,
    /// Slots reserved for sessions being created or returned.
    pub pending: u32,
    /// Number of acquire calls queued for a session.
    pub waiting: u32,
    /// Sessions counted against the maximum (`idle + in_use + pending`).
    pub total: u32,
    /// Maximum allowed sessions.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.in_use) / f64::from(self.max)) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Sessions created by the factory for this pool.
    pub sessions_created: u64,
    /// Sessions closed by the pool.
    pub sessions_closed: u64,
    /// Factory failures, on acquire or in the background.
    pub creation_failures: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (timeouts, creation failures, closed pool).
    pub checkouts_failed: u64,
    /// Sessions handed from a releaser directly to a waiter.
    pub hand_offs: u64,
    /// Idle sessions evicted for exceeding the expiration timeout.
    pub evictions: u64,
    /// Released sessions destroyed by the recycle policy.
    pub recycle_destroys: u64,
    /// Released sessions whose cleanup failed.
    pub cleanup_failures: u64,
    /// Total time waiters spent queued.
    pub total_wait: Duration,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

/// Lock-free counters updated by the pool.
#[derive(Debug, Default)]
pub(crate) struct AtomicPoolMetrics {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    creation_failures: AtomicU64,
    checkouts_successful: AtomicU64,
    checkouts_failed: AtomicU64,
    hand_offs: AtomicU64,
    evictions: AtomicU64,
    recycle_destroys: AtomicU64,
    cleanup_failures: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl AtomicPoolMetrics {
    pub(crate) fn record_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkout(&self) {
        self.checkouts_successful.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkout_failure(&self) {
        self.checkouts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hand_off(&self, waited: Duration) {
        self.hand_offs.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.total_wait_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_recycle_destroy(&self) {
        self.recycle_destroys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cleanup_failure(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, uptime: Duration) -> PoolMetrics {
        PoolMetrics {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            checkouts_successful: self.checkouts_successful.load(Ordering::Relaxed),
            checkouts_failed: self.checkouts_failed.load(Ordering::Relaxed),
            hand_offs: self.hand_offs.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            recycle_destroys: self.recycle_destroys.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed)),
            uptime,
        }
    }
}
