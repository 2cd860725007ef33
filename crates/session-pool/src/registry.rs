//! Process-wide pool registry.
//!
//! The registry maps connection strings to pools under one of two
//! topologies and owns the defaults new pools are created with. Switching
//! topology or clearing the registry installs fresh, empty pools first and
//! then closes the old ones, so concurrent callers always find a usable
//! pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::eviction::{DEFAULT_EVICTION_INTERVAL, EvictionScheduler};
use crate::key::PoolKey;
use crate::lifecycle::SessionFactory;
use crate::pool::{Pool, PooledSession};
use crate::recycle::ChangedSessionBehavior;

/// How connection strings map to pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// One pool shared by every connection string.
    SingleShared,
    /// One pool per distinct [`PoolKey`].
    #[default]
    Keyed,
}

enum Pools<F: SessionFactory> {
    SingleShared(Pool<F>),
    Keyed(HashMap<PoolKey, Pool<F>>),
}

impl<F: SessionFactory> Pools<F> {
    fn empty(topology: Topology, defaults: &PoolConfig, factory: &Arc<F>) -> Result<Self> {
        Ok(match topology {
            Topology::SingleShared => {
                Self::SingleShared(Pool::new_shared(defaults.clone(), Arc::clone(factory))?)
            }
            Topology::Keyed => Self::Keyed(HashMap::new()),
        })
    }

    fn topology(&self) -> Topology {
        match self {
            Self::SingleShared(_) => Topology::SingleShared,
            Self::Keyed(_) => Topology::Keyed,
        }
    }

    fn all(&self) -> Vec<Pool<F>> {
        match self {
            Self::SingleShared(pool) => vec![pool.clone()],
            Self::Keyed(pools) => pools.values().cloned().collect(),
        }
    }
}

/// Saved registry settings, for restoring after a temporary change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Topology at snapshot time.
    pub topology: Topology,
    /// Defaults new pools were created with.
    pub defaults: PoolConfig,
}

/// Builder for [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    topology: Topology,
    defaults: PoolConfig,
    eviction_interval: Duration,
}

impl RegistryBuilder {
    /// Create a builder with the default topology and pool settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topology: Topology::default(),
            defaults: PoolConfig::default(),
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }

    /// Set the initial topology.
    #[must_use]
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the defaults pools are created with.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.defaults = config;
        self
    }

    /// Set the interval of the background eviction sweep.
    #[must_use]
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Build the registry.
    ///
    /// The eviction sweep starts immediately when called inside a Tokio
    /// runtime, and otherwise on first pool lookup inside one.
    pub fn build<F: SessionFactory>(self, factory: F) -> Result<Registry<F>> {
        self.defaults.validate()?;
        if self.eviction_interval.is_zero() {
            return Err(PoolError::Configuration(
                "eviction interval must be greater than 0".into(),
            ));
        }

        let factory = Arc::new(factory);
        let pools = Pools::empty(self.topology, &self.defaults, &factory)?;
        let registry = Registry {
            inner: Arc::new(RegistryInner {
                factory,
                state: RwLock::new(RegistryState {
                    defaults: self.defaults,
                    pools,
                }),
                eviction_interval: self.eviction_interval,
                scheduler: Mutex::new(None),
            }),
        };
        registry.ensure_scheduler();
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of session pools.
///
/// `Registry` is a cheap handle; clones share the same pools.
pub struct Registry<F: SessionFactory> {
    inner: Arc<RegistryInner<F>>,
}

struct RegistryInner<F: SessionFactory> {
    factory: Arc<F>,
    state: RwLock<RegistryState<F>>,
    eviction_interval: Duration,
    scheduler: Mutex<Option<EvictionScheduler>>,
}

struct RegistryState<F: SessionFactory> {
    defaults: PoolConfig,
    pools: Pools<F>,
}

impl<F: SessionFactory> Registry<F> {
    /// Create a registry with default settings.
    pub fn new(factory: F) -> Result<Self> {
        RegistryBuilder::new().build(factory)
    }

    /// The factory pools create sessions with.
    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    /// Look up the pool serving `conn_str`, creating it if needed.
    pub fn get_pool(&self, conn_str: &str) -> Result<Pool<F>> {
        self.pool_for_key(&PoolKey::parse(conn_str)?)
    }

    /// Look up the pool serving `key`, creating it if needed.
    ///
    /// Under [`Topology::Keyed`] a new pool takes the registry defaults
    /// overridden by the pooling keys in `key`, and starts its min-size fill
    /// on first checkout. Under [`Topology::SingleShared`] the shared pool
    /// is returned with a handle whose [`Pool::acquire`] connects with `key`.
    pub fn pool_for_key(&self, key: &PoolKey) -> Result<Pool<F>> {
        self.ensure_scheduler();

        {
            let state = self.inner.state.read();
            match &state.pools {
                Pools::SingleShared(pool) => return Ok(pool.with_connect_key(key.clone())),
                Pools::Keyed(pools) => {
                    if let Some(pool) = pools.get(key) {
                        return Ok(pool.clone());
                    }
                }
            }
        }

        let mut state = self.inner.state.write();
        let config = state.defaults.clone().apply_key(key)?;
        match &mut state.pools {
            Pools::SingleShared(pool) => Ok(pool.with_connect_key(key.clone())),
            Pools::Keyed(pools) => {
                if let Some(pool) = pools.get(key) {
                    return Ok(pool.clone());
                }
                let pool = Pool::new_lazy(key.clone(), config, Arc::clone(&self.inner.factory))?;
                pools.insert(key.clone(), pool.clone());
                Ok(pool)
            }
        }
    }

    /// Acquire a session for `conn_str`.
    ///
    /// If the pool is closed by a concurrent topology switch or clear while
    /// the call is in flight, it is retried once against the replacement.
    pub async fn acquire(&self, conn_str: &str) -> Result<PooledSession<F>> {
        let key = PoolKey::parse(conn_str)?;
        let pool = self.pool_for_key(&key)?;

        match pool.acquire_for(&key).await {
            Err(PoolError::PoolClosed) => {
                let current = self.pool_for_key(&key)?;
                if current.same_pool(&pool) {
                    return Err(PoolError::PoolClosed);
                }
                tracing::debug!(pool = %key, "pool replaced during acquire, retrying");
                current.acquire_for(&key).await
            }
            other => other,
        }
    }

    /// Current topology.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.inner.state.read().pools.topology()
    }

    /// Switch topology. Does nothing if it is already `topology`.
    pub async fn set_topology(&self, topology: Topology) -> Result<()> {
        self.install(Some(topology), None, true).await
    }

    /// Switch topology unconditionally, discarding every existing pool.
    pub async fn force_topology(&self, topology: Topology) -> Result<()> {
        self.install(Some(topology), None, false).await
    }

    /// Discard every pool, keeping topology and defaults.
    pub async fn clear_all_pools(&self) -> Result<()> {
        self.install(None, None, false).await
    }

    /// Capture topology and defaults.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.inner.state.read();
        RegistrySnapshot {
            topology: state.pools.topology(),
            defaults: state.defaults.clone(),
        }
    }

    /// Reinstate a snapshot. Existing pools are discarded.
    pub async fn restore(&self, snapshot: RegistrySnapshot) -> Result<()> {
        self.install(Some(snapshot.topology), Some(snapshot.defaults), false)
            .await
    }

    /// Replace every pool. `None` keeps the topology current at the time
    /// the write lock is taken.
    async fn install(
        &self,
        topology: Option<Topology>,
        defaults: Option<PoolConfig>,
        only_if_changed: bool,
    ) -> Result<()> {
        let (topology, old) = {
            let mut state = self.inner.state.write();
            let current = state.pools.topology();
            let topology = topology.unwrap_or(current);
            if only_if_changed && current == topology {
                return Ok(());
            }
            let defaults = match defaults {
                Some(defaults) => {
                    defaults.validate()?;
                    defaults
                }
                None => state.defaults.clone(),
            };
            let fresh = Pools::empty(topology, &defaults, &self.inner.factory)?;
            state.defaults = defaults;
            (topology, std::mem::replace(&mut state.pools, fresh))
        };

        let pools = old.all();
        tracing::info!(?topology, closed_pools = pools.len(), "pool registry reset");
        for pool in pools {
            pool.close().await;
        }
        Ok(())
    }

    /// Every live pool.
    #[must_use]
    pub fn pools(&self) -> Vec<Pool<F>> {
        self.inner.state.read().pools.all()
    }

    /// Number of live pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        match &self.inner.state.read().pools {
            Pools::SingleShared(_) => 1,
            Pools::Keyed(pools) => pools.len(),
        }
    }

    /// Sum of the sizes of every pool.
    #[must_use]
    pub fn current_pool_size(&self) -> usize {
        self.pools().iter().map(Pool::current_size).sum()
    }

    /// Defaults new pools are created with.
    #[must_use]
    pub fn defaults(&self) -> PoolConfig {
        self.inner.state.read().defaults.clone()
    }

    /// The effective settings: the shared pool's under
    /// [`Topology::SingleShared`], the defaults under [`Topology::Keyed`].
    fn effective_config(&self) -> PoolConfig {
        let state = self.inner.state.read();
        match &state.pools {
            Pools::SingleShared(pool) => pool.config(),
            Pools::Keyed(_) => state.defaults.clone(),
        }
    }

    /// Maximum pool size.
    #[must_use]
    pub fn max_pool_size(&self) -> u32 {
        self.effective_config().max_pool_size
    }

    /// Minimum pool size.
    #[must_use]
    pub fn min_pool_size(&self) -> u32 {
        self.effective_config().min_pool_size
    }

    /// Acquire wait timeout.
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        self.effective_config().wait_timeout
    }

    /// Idle expiration timeout.
    #[must_use]
    pub fn expiration_timeout(&self) -> Option<Duration> {
        self.effective_config().expiration_timeout
    }

    /// Changed-session behavior.
    #[must_use]
    pub fn changed_session(&self) -> ChangedSessionBehavior {
        self.effective_config().changed_session
    }

    /// Whether pooling is enabled.
    #[must_use]
    pub fn pooling_enabled(&self) -> bool {
        self.effective_config().pooling_enabled
    }

    /// Set the maximum pool size of the defaults and every live pool.
    pub fn set_max_pool_size(&self, size: u32) -> Result<()> {
        self.update_all(|config| config.max_pool_size = size)
    }

    /// Set the minimum pool size of the defaults and every live pool.
    pub fn set_min_pool_size(&self, size: u32) -> Result<()> {
        self.update_all(|config| config.min_pool_size = size)
    }

    /// Set the acquire wait timeout of the defaults and every live pool.
    pub fn set_wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_all(|config| config.wait_timeout = timeout)
    }

    /// Set the expiration timeout of the defaults and every live pool.
    ///
    /// Takes effect on sessions that are already idle.
    pub fn set_expiration_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.update_all(|config| config.expiration_timeout = timeout)
    }

    /// Set the changed-session behavior of the defaults and every live pool.
    pub fn set_changed_session(&self, behavior: ChangedSessionBehavior) -> Result<()> {
        self.update_all(|config| config.changed_session = behavior)
    }

    /// Enable or disable pooling.
    ///
    /// Disabling is rejected under [`Topology::Keyed`]: pooling is then
    /// controlled per connection string or per pool.
    pub fn set_pooling(&self, enabled: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        if !enabled && state.pools.topology() == Topology::Keyed {
            return Err(PoolError::InvalidOperation(
                "pooling cannot be disabled registry-wide under the keyed topology; \
                 use poolingEnabled=false in the connection string or disable it on a pool"
                    .into(),
            ));
        }
        Self::apply_locked(&mut state, |config| config.pooling_enabled = enabled)
    }

    fn update_all(&self, apply: impl Fn(&mut PoolConfig)) -> Result<()> {
        let mut state = self.inner.state.write();
        Self::apply_locked(&mut state, apply)
    }

    fn apply_locked(state: &mut RegistryState<F>, apply: impl Fn(&mut PoolConfig)) -> Result<()> {
        let mut defaults = state.defaults.clone();
        apply(&mut defaults);
        defaults.validate()?;
        state.defaults = defaults;

        for pool in state.pools.all() {
            pool.reconfigure(&apply)?;
        }
        Ok(())
    }

    fn ensure_scheduler(&self) {
        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.as_ref().is_some_and(EvictionScheduler::is_running) {
            return;
        }
        if Handle::try_current().is_err() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let spawned = EvictionScheduler::spawn(self.inner.eviction_interval, move || {
            let inner = weak.upgrade()?;
            let pools = inner.state.read().pools.all();
            Some(pools)
        });
        match spawned {
            Ok(spawned) => *scheduler = Some(spawned),
            Err(e) => tracing::debug!(error = %e, "eviction scheduler not started"),
        }
    }
}

impl<F: SessionFactory> Clone for Registry<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SessionFactory> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("topology", &self.topology())
            .field("pools", &self.pool_count())
            .finish()
    }
}
