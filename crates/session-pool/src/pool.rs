//! Session pool implementation.
//!
//! All bookkeeping (idle set, busy set, reserved slots, wait queue) lives in
//! one [`PoolState`] behind a single mutex. Factory calls are slow network
//! I/O and always run with the lock released: a slot is reserved under the
//! lock, the factory is called unlocked, and the result is registered back
//! under the lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::key::PoolKey;
use crate::lifecycle::{EntryMetadata, Session, SessionFactory, SessionId};
use crate::metrics::{AtomicPoolMetrics, PoolMetrics, PoolStatus};
use crate::recycle::{self, ChangedSessionBehavior, Recycle, SessionProperties};
use crate::wait_queue::WaitQueue;

/// A pool of server sessions sharing one [`PoolKey`].
///
/// `Pool` is a cheap handle; clones share the same sessions.
///
/// # Example
///
/// ```rust,ignore
/// use session_pool::{Pool, PoolConfig, PoolKey};
///
/// let key = PoolKey::parse("account=acme;user=etl;db=sales")?;
/// let pool = Pool::new(key, PoolConfig::new().max_pool_size(4), factory)?;
///
/// let session = pool.acquire().await?;
/// // Use session...
/// session.release().await?;
/// ```
pub struct Pool<F: SessionFactory> {
    inner: Arc<PoolInner<F>>,
    /// Key [`Pool::acquire`] creates sessions with. `None` for a shared-pool
    /// handle not obtained for a connection string.
    connect_key: Option<PoolKey>,
}

struct PoolInner<F: SessionFactory> {
    key: PoolKey,
    shared: bool,
    factory: Arc<F>,
    state: Mutex<PoolState<F::Session>>,
    metrics: AtomicPoolMetrics,
    created_at: Instant,
}

struct IdleEntry<S> {
    session: S,
    meta: EntryMetadata,
}

struct PoolState<S> {
    config: PoolConfig,
    /// Idle sessions; the most recently released is at the end.
    idle: Vec<IdleEntry<S>>,
    /// Checked-out sessions.
    busy: HashMap<SessionId, EntryMetadata>,
    /// Sessions handed out while pooling was disabled. Not counted.
    unpooled: HashSet<SessionId>,
    /// Slots reserved for sessions being created or returned.
    pending: usize,
    waiters: WaitQueue<S>,
    /// Key the background filler connects with.
    fill_key: Option<PoolKey>,
    filling: bool,
    closed: bool,
}

/// Where a released session ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckIn {
    /// The session entered the idle set.
    Idle,
    /// The session went straight to the oldest waiter.
    HandedOff,
    /// The session was closed.
    Destroyed,
}

impl<S: Session> PoolState<S> {
    fn new(config: PoolConfig, fill_key: Option<PoolKey>) -> Self {
        Self {
            config,
            idle: Vec::new(),
            busy: HashMap::new(),
            unpooled: HashSet::new(),
            pending: 0,
            waiters: WaitQueue::new(),
            fill_key,
            filling: false,
            closed: false,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }

    fn has_capacity(&self) -> bool {
        self.total() < self.config.max_pool_size as usize
    }

    fn fill_needed(&self) -> bool {
        !self.closed
            && self.config.pooling_enabled
            && self.fill_key.is_some()
            && self.has_capacity()
            && (!self.waiters.is_empty() || self.total() < self.config.fill_target() as usize)
    }

    /// Check out the most recently released usable idle session. Expired or
    /// dead sessions met on the way are moved to `stale`.
    fn take_idle(&mut self, now: Instant, stale: &mut Vec<S>) -> Option<S> {
        while let Some(IdleEntry { session, mut meta }) = self.idle.pop() {
            let expired = self
                .config
                .expiration_timeout
                .is_some_and(|timeout| meta.is_idle_expired(now, timeout));
            if expired || !session.is_established() {
                stale.push(session);
                continue;
            }
            meta.mark_checkout();
            self.busy.insert(session.id(), meta);
            return Some(session);
        }
        None
    }

    /// Return a reusable session: to the head waiter if there is one,
    /// otherwise to the idle set.
    fn check_in(
        &mut self,
        session: S,
        mut meta: EntryMetadata,
        now: Instant,
        metrics: &AtomicPoolMetrics,
    ) -> CheckIn {
        let id = session.id();
        match self.waiters.hand_off(session, now) {
            Ok(hand_off) => {
                meta.mark_checkout();
                self.busy.insert(id, meta);
                metrics.record_hand_off(hand_off.waited);
                tracing::debug!(
                    session_id = %id,
                    waiter = hand_off.arrival,
                    waited = ?hand_off.waited,
                    "session handed to waiter"
                );
                CheckIn::HandedOff
            }
            Err(session) => {
                meta.mark_checkin(now);
                self.idle.push(IdleEntry { session, meta });
                CheckIn::Idle
            }
        }
    }

    fn drain_idle(&mut self) -> Vec<S> {
        self.idle.drain(..).map(|entry| entry.session).collect()
    }

    /// Established sessions owned by the pool. Slots reserved for sessions
    /// still being created are not included.
    fn size(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn status(&self) -> PoolStatus {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        PoolStatus {
            idle: count(self.idle.len()),
            in_use: count(self.busy.len()),
            pending: count(self.pending),
            waiting: count(self.waiters.len()),
            total: count(self.total()),
            max: self.config.max_pool_size,
        }
    }
}

/// How long a checkout may wait in the queue.
#[derive(Debug, Clone, Copy)]
enum Wait {
    Configured,
    Until(Instant),
    Forever,
}

enum Step<S> {
    Ready(S),
    Create,
    Unpooled,
    Queued {
        arrival: u64,
        rx: oneshot::Receiver<S>,
        deadline: Option<Instant>,
    },
}

enum Returning {
    Unpooled,
    NotOwned,
    Pooled(EntryMetadata, ChangedSessionBehavior),
}

impl<F: SessionFactory> Pool<F> {
    /// Create a pool for `key`.
    ///
    /// Must be called within a Tokio runtime for the background min-size
    /// fill to start; outside one the pool still works but only fills on
    /// demand.
    pub fn new(key: PoolKey, config: PoolConfig, factory: Arc<F>) -> Result<Self> {
        config.validate()?;
        let pool = Self::build(key.clone(), false, Some(key), config, factory);
        pool.maybe_fill();
        Ok(pool)
    }

    /// Create a pool whose min-size fill starts with its first checkout.
    pub(crate) fn new_lazy(key: PoolKey, config: PoolConfig, factory: Arc<F>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(key, false, None, config, factory))
    }

    /// Create the pool of the single-shared topology. It has no key of its
    /// own and fills with the key of the most recent caller.
    pub(crate) fn new_shared(config: PoolConfig, factory: Arc<F>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(PoolKey::default(), true, None, config, factory))
    }

    fn build(
        key: PoolKey,
        shared: bool,
        fill_key: Option<PoolKey>,
        config: PoolConfig,
        factory: Arc<F>,
    ) -> Self {
        tracing::info!(
            pool = %key,
            min = config.min_pool_size,
            max = config.max_pool_size,
            pooling = config.pooling_enabled,
            "session pool created"
        );
        Self::from_inner(Arc::new(PoolInner {
            key,
            shared,
            factory,
            state: Mutex::new(PoolState::new(config, fill_key)),
            metrics: AtomicPoolMetrics::default(),
            created_at: Instant::now(),
        }))
    }

    fn from_inner(inner: Arc<PoolInner<F>>) -> Self {
        let connect_key = (!inner.shared).then(|| inner.key.clone());
        Self { inner, connect_key }
    }

    /// A handle on the same pool whose [`Pool::acquire`] connects with `key`.
    pub(crate) fn with_connect_key(&self, key: PoolKey) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            connect_key: Some(key),
        }
    }

    fn connect_key(&self) -> Result<&PoolKey> {
        self.connect_key.as_ref().ok_or_else(|| {
            PoolError::InvalidOperation(
                "shared pool handle has no connection string; use acquire_for".into(),
            )
        })
    }

    /// Get a session, waiting at most the configured wait timeout.
    ///
    /// Returns an idle session if one exists, creates a new one if the pool
    /// is below its maximum, and otherwise queues behind earlier callers.
    ///
    /// Sessions are created with the key this handle was obtained for. A
    /// shared-pool handle without one fails with
    /// [`PoolError::InvalidOperation`].
    pub async fn acquire(&self) -> Result<PooledSession<F>> {
        self.checkout(self.connect_key()?, Wait::Configured).await
    }

    /// Get a session, waiting until `deadline` (`None` waits indefinitely).
    pub async fn acquire_until(&self, deadline: Option<Instant>) -> Result<PooledSession<F>> {
        let wait = match deadline {
            Some(deadline) => Wait::Until(deadline),
            None => Wait::Forever,
        };
        self.checkout(self.connect_key()?, wait).await
    }

    /// Get a session, creating it for `key` on a miss.
    ///
    /// This is how the single-shared pool serves callers with different
    /// connection strings.
    pub async fn acquire_for(&self, key: &PoolKey) -> Result<PooledSession<F>> {
        self.checkout(key, Wait::Configured).await
    }

    /// Take an idle session without creating or waiting.
    ///
    /// Returns `None` if no idle session is immediately available.
    pub fn try_acquire(&self) -> Result<Option<PooledSession<F>>> {
        let mut stale = Vec::new();
        let session = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if state.config.pooling_enabled && state.waiters.is_empty() {
                state.take_idle(Instant::now(), &mut stale)
            } else {
                None
            }
        };
        self.evict_stale(stale);

        Ok(session.map(|session| {
            self.inner.metrics.record_checkout();
            PooledSession::new(session, self.clone())
        }))
    }

    async fn checkout(&self, key: &PoolKey, wait: Wait) -> Result<PooledSession<F>> {
        let started = Instant::now();
        tracing::trace!(pool = %self.inner.key, "acquiring session");

        loop {
            let mut stale = Vec::new();
            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    None
                } else if !state.config.pooling_enabled {
                    Some(Step::Unpooled)
                } else {
                    if state.fill_key.as_ref() != Some(key) {
                        state.fill_key = Some(key.clone());
                    }
                    let now = Instant::now();
                    let idle = if state.waiters.is_empty() {
                        state.take_idle(now, &mut stale)
                    } else {
                        None
                    };
                    match idle {
                        Some(session) => Some(Step::Ready(session)),
                        None if state.waiters.is_empty() && state.has_capacity() => {
                            state.pending += 1;
                            Some(Step::Create)
                        }
                        None => {
                            let deadline = match wait {
                                Wait::Configured => Some(started + state.config.wait_timeout),
                                Wait::Until(deadline) => Some(deadline),
                                Wait::Forever => None,
                            };
                            let (arrival, rx) = state.waiters.push(now);
                            Some(Step::Queued {
                                arrival,
                                rx,
                                deadline,
                            })
                        }
                    }
                }
            };
            self.evict_stale(stale);
            self.maybe_fill();

            let Some(step) = step else {
                self.inner.metrics.record_checkout_failure();
                return Err(PoolError::PoolClosed);
            };

            match step {
                Step::Ready(session) => {
                    self.inner.metrics.record_checkout();
                    tracing::trace!(session_id = %session.id(), "reusing idle session");
                    return Ok(PooledSession::new(session, self.clone()));
                }
                Step::Create => return self.create_for_caller(key).await,
                Step::Unpooled => return self.create_unpooled(key).await,
                Step::Queued {
                    arrival,
                    rx,
                    deadline,
                } => {
                    match self.wait_for_session(arrival, rx, deadline, started).await {
                        Ok(Some(session)) => {
                            self.inner.metrics.record_checkout();
                            return Ok(PooledSession::new(session, self.clone()));
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            self.inner.metrics.record_checkout_failure();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Block until a releaser hands us a session or the deadline passes.
    ///
    /// `Ok(None)` means the queue was flushed without closing the pool
    /// (pooling was disabled); the caller starts over.
    async fn wait_for_session(
        &self,
        arrival: u64,
        rx: oneshot::Receiver<F::Session>,
        deadline: Option<Instant>,
        started: Instant,
    ) -> Result<Option<F::Session>> {
        let mut waiter = QueuedWaiter {
            pool: self,
            arrival,
            rx,
            armed: true,
        };

        let received = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, &mut waiter.rx).await {
                    Ok(received) => received.map_err(|_| ()),
                    Err(_) => {
                        waiter.armed = false;
                        let removed = self.inner.state.lock().waiters.remove(arrival);
                        if removed {
                            let waited = deadline.saturating_duration_since(started);
                            tracing::debug!(pool = %self.inner.key, ?waited, "acquire timed out");
                            return Err(PoolError::Timeout(waited));
                        }
                        // Served between the deadline firing and us taking the lock.
                        waiter.rx.try_recv().map_err(|_| ())
                    }
                }
            }
            None => (&mut waiter.rx).await.map_err(|_| ()),
        };
        waiter.armed = false;

        match received {
            Ok(session) => Ok(Some(session)),
            Err(()) if self.is_closed() => Err(PoolError::PoolClosed),
            Err(()) => Ok(None),
        }
    }

    async fn create_for_caller(&self, key: &PoolKey) -> Result<PooledSession<F>> {
        let slot = PendingSlot { pool: self, armed: true };

        match self.inner.factory.create_session(key).await {
            Ok(session) => {
                let id = session.id();
                {
                    let mut state = self.inner.state.lock();
                    state.pending -= 1;
                    state.busy.insert(id, EntryMetadata::new_busy(Instant::now()));
                }
                slot.disarm();
                self.inner.metrics.record_created();
                self.inner.metrics.record_checkout();
                tracing::debug!(pool = %self.inner.key, session_id = %id, "created session");
                Ok(PooledSession::new(session, self.clone()))
            }
            Err(e) => {
                // Frees the reserved slot; queued waiters get it via the filler.
                drop(slot);
                self.inner.metrics.record_creation_failure();
                self.inner.metrics.record_checkout_failure();
                tracing::warn!(pool = %self.inner.key, error = %e, "session creation failed");
                Err(PoolError::SessionCreation(e))
            }
        }
    }

    async fn create_unpooled(&self, key: &PoolKey) -> Result<PooledSession<F>> {
        let session = match self.inner.factory.create_session(key).await {
            Ok(session) => session,
            Err(e) => {
                self.inner.metrics.record_creation_failure();
                self.inner.metrics.record_checkout_failure();
                return Err(PoolError::SessionCreation(e));
            }
        };
        self.inner.state.lock().unpooled.insert(session.id());
        self.inner.metrics.record_created();
        self.inner.metrics.record_checkout();
        tracing::debug!(session_id = %session.id(), "created unpooled session");
        Ok(PooledSession::new(session, self.clone()))
    }

    /// Return a checked-out session to the pool.
    ///
    /// `before` is the property snapshot taken at checkout; the recycle
    /// policy compares it with the session's current snapshot. Reused
    /// sessions are cleaned with [`Session::reset`] first; if that fails the
    /// session is closed and [`PoolError::RecycleCleanup`] is returned.
    ///
    /// Releasing a session this pool did not hand out, or releasing one
    /// twice, fails with [`PoolError::SessionNotOwned`].
    pub async fn release_session(
        &self,
        mut session: F::Session,
        before: &SessionProperties,
    ) -> Result<CheckIn> {
        let id = session.id();
        let returning = {
            let mut state = self.inner.state.lock();
            if state.unpooled.remove(&id) {
                Returning::Unpooled
            } else if let Some(meta) = state.busy.remove(&id) {
                state.pending += 1;
                Returning::Pooled(meta, state.config.changed_session)
            } else {
                Returning::NotOwned
            }
        };

        let (meta, mode) = match returning {
            Returning::Pooled(meta, mode) => (meta, mode),
            Returning::Unpooled => {
                self.close_session(session).await;
                return Ok(CheckIn::Destroyed);
            }
            Returning::NotOwned => {
                tracing::warn!(
                    pool = %self.inner.key,
                    session_id = %id,
                    "release of a session not checked out from this pool"
                );
                return Err(PoolError::SessionNotOwned { id });
            }
        };
        let slot = PendingSlot { pool: self, armed: true };

        let mut decision = recycle::decide(before, &session.properties(), mode);
        if decision == Recycle::Destroy {
            self.inner.metrics.record_recycle_destroy();
        } else if !session.is_established() {
            tracing::debug!(session_id = %id, "released session is no longer established");
            decision = Recycle::Destroy;
        }

        let mut cleanup_error = None;
        if decision == Recycle::Reuse {
            if let Err(e) = session.reset().await {
                tracing::warn!(session_id = %id, error = %e, "session cleanup failed, destroying");
                self.inner.metrics.record_cleanup_failure();
                cleanup_error = Some(e);
                decision = Recycle::Destroy;
            }
        }

        let now = Instant::now();
        let (outcome, leftover) = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            if decision == Recycle::Reuse && !state.closed && state.config.pooling_enabled {
                let outcome = state.check_in(session, meta, now, &self.inner.metrics);
                (outcome, None)
            } else {
                (CheckIn::Destroyed, Some(session))
            }
        };
        slot.disarm();

        if let Some(session) = leftover {
            self.close_session(session).await;
            self.maybe_fill();
        }
        tracing::trace!(session_id = %id, ?outcome, "session released");

        match cleanup_error {
            Some(e) => Err(PoolError::RecycleCleanup(e)),
            None => Ok(outcome),
        }
    }

    /// Put back a session that was delivered to a waiter who is gone.
    fn return_unused(&self, session: F::Session) {
        let id = session.id();
        let leftover = {
            let mut state = self.inner.state.lock();
            match state.busy.remove(&id) {
                Some(meta) if !state.closed && state.config.pooling_enabled => {
                    state.check_in(session, meta, Instant::now(), &self.inner.metrics);
                    None
                }
                _ => Some(session),
            }
        };
        if let Some(session) = leftover {
            self.discard(vec![session]);
        }
    }

    /// Stop tracking a checked-out session without closing it.
    fn forget(&self, id: SessionId) {
        {
            let mut state = self.inner.state.lock();
            if !state.unpooled.remove(&id) {
                state.busy.remove(&id);
            }
        }
        tracing::debug!(session_id = %id, "session detached from pool");
        self.maybe_fill();
    }

    async fn close_session(&self, session: F::Session) {
        let id = session.id();
        match self.inner.factory.close_session(session).await {
            Ok(()) => tracing::debug!(pool = %self.inner.key, session_id = %id, "closed session"),
            Err(e) => tracing::warn!(
                pool = %self.inner.key,
                session_id = %id,
                error = %e,
                "failed to close session"
            ),
        }
        self.inner.metrics.record_closed();
    }

    /// Close idle sessions found expired or dead at checkout.
    fn evict_stale(&self, stale: Vec<F::Session>) {
        if stale.is_empty() {
            return;
        }
        tracing::debug!(pool = %self.inner.key, count = stale.len(), "evicting stale idle sessions");
        self.inner.metrics.record_evictions(stale.len() as u64);
        self.discard(stale);
    }

    /// Close sessions in the background.
    fn discard(&self, sessions: Vec<F::Session>) {
        if sessions.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move {
                    for session in sessions {
                        pool.close_session(session).await;
                    }
                    pool.maybe_fill();
                });
            }
            Err(_) => {
                tracing::warn!(
                    count = sessions.len(),
                    "no runtime available, dropping sessions without closing them"
                );
            }
        }
    }

    /// Start the background filler if the pool is below its target or has
    /// waiters it could serve.
    pub(crate) fn maybe_fill(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.filling || !state.fill_needed() {
                return;
            }
            state.filling = true;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move { pool.fill().await });
            }
            Err(_) => {
                self.inner.state.lock().filling = false;
                tracing::debug!("no runtime available, skipping background fill");
            }
        }
    }

    async fn fill(&self) {
        loop {
            let key = {
                let mut state = self.inner.state.lock();
                match state.fill_key.clone() {
                    Some(key) if state.fill_needed() => {
                        state.pending += 1;
                        key
                    }
                    _ => {
                        state.filling = false;
                        return;
                    }
                }
            };
            let slot = PendingSlot { pool: self, armed: true };

            match self.inner.factory.create_session(&key).await {
                Ok(session) => {
                    self.inner.metrics.record_created();
                    let id = session.id();
                    let now = Instant::now();
                    let leftover = {
                        let mut state = self.inner.state.lock();
                        state.pending -= 1;
                        if state.closed || !state.config.pooling_enabled {
                            Some(session)
                        } else {
                            let meta = EntryMetadata::new_idle(now);
                            let outcome = state.check_in(session, meta, now, &self.inner.metrics);
                            tracing::debug!(session_id = %id, ?outcome, "background fill created session");
                            None
                        }
                    };
                    slot.disarm();
                    if let Some(session) = leftover {
                        self.close_session(session).await;
                    }
                }
                Err(e) => {
                    {
                        let mut state = self.inner.state.lock();
                        state.pending -= 1;
                        state.filling = false;
                    }
                    slot.disarm();
                    self.inner.metrics.record_creation_failure();
                    tracing::warn!(pool = %self.inner.key, error = %e, "background session creation failed");
                    return;
                }
            }
        }
    }

    /// Close idle sessions that exceeded the expiration timeout or are no
    /// longer established. Returns the number of sessions evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.inner.state.lock();
            let timeout = state.config.expiration_timeout;
            let (keep, expired): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.idle).into_iter().partition(|entry| {
                    entry.session.is_established()
                        && !timeout.is_some_and(|t| entry.meta.is_idle_expired(now, t))
                });
            state.idle = keep;
            expired
        };

        let count = expired.len();
        if count > 0 {
            tracing::debug!(pool = %self.inner.key, count, "evicting idle sessions");
            self.inner.metrics.record_evictions(count as u64);
            for entry in expired {
                self.close_session(entry.session).await;
            }
        }
        self.maybe_fill();
        count
    }

    pub(crate) fn reconfigure(&self, apply: impl FnOnce(&mut PoolConfig)) -> Result<()> {
        let discarded = {
            let mut state = self.inner.state.lock();
            let mut config = state.config.clone();
            apply(&mut config);
            config.validate()?;

            let disabling = state.config.pooling_enabled && !config.pooling_enabled;
            state.config = config;
            if disabling {
                // Queued callers retry and get unpooled sessions.
                state.waiters.close_all();
                state.drain_idle()
            } else {
                Vec::new()
            }
        };

        self.discard(discarded);
        self.maybe_fill();
        Ok(())
    }

    /// Set the maximum pool size. Existing sessions above a lowered maximum
    /// are kept until they are released or evicted.
    pub fn set_max_pool_size(&self, size: u32) -> Result<()> {
        self.reconfigure(|config| config.max_pool_size = size)
    }

    /// Set the background-filled minimum pool size.
    pub fn set_min_pool_size(&self, size: u32) -> Result<()> {
        self.reconfigure(|config| config.min_pool_size = size)
    }

    /// Set how long acquires wait when the pool is full.
    pub fn set_wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.reconfigure(|config| config.wait_timeout = timeout)
    }

    /// Set the idle expiration timeout. Applies to sessions already idle.
    pub fn set_expiration_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.reconfigure(|config| config.expiration_timeout = timeout)
    }

    /// Set the changed-session behavior.
    pub fn set_changed_session(&self, behavior: ChangedSessionBehavior) -> Result<()> {
        self.reconfigure(|config| config.changed_session = behavior)
    }

    /// Enable or disable session retention for this pool.
    ///
    /// Disabling closes idle sessions; busy sessions are closed when
    /// released. Size and timeout settings are kept, so re-enabling restores
    /// them unchanged.
    pub fn set_pooling_enabled(&self, enabled: bool) -> Result<()> {
        self.reconfigure(|config| config.pooling_enabled = enabled)?;
        tracing::info!(pool = %self.inner.key, enabled, "pooling toggled");
        Ok(())
    }

    /// Whether the pool retains released sessions.
    #[must_use]
    pub fn pooling_enabled(&self) -> bool {
        self.inner.state.lock().config.pooling_enabled
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    /// Number of established sessions the pool owns, idle or checked out.
    ///
    /// Sessions still being created are not counted here, though they do
    /// count against the maximum (see [`PoolStatus::total`]).
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.inner.state.lock().size()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().status()
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics.snapshot(self.inner.created_at.elapsed())
    }

    /// The key this pool was created for (empty for the shared pool).
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// The factory sessions are created with.
    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    /// Close the pool.
    ///
    /// Queued acquires fail with [`PoolError::PoolClosed`], idle sessions are
    /// closed, and checked-out sessions are closed when released.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.drain_idle(), state.waiters.close_all())
        };

        tracing::info!(
            pool = %self.inner.key,
            idle = idle.len(),
            waiters,
            "session pool closed"
        );
        for session in idle {
            self.close_session(session).await;
        }
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakPool<F> {
        WeakPool(Arc::downgrade(&self.inner))
    }
}

impl<F: SessionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            connect_key: self.connect_key.clone(),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning pool handle held by background tasks.
pub(crate) struct WeakPool<F: SessionFactory>(Weak<PoolInner<F>>);

impl<F: SessionFactory> WeakPool<F> {
    pub(crate) fn upgrade(&self) -> Option<Pool<F>> {
        self.0.upgrade().map(Pool::from_inner)
    }
}

/// A reserved slot in `pending`. Dropping it un-reserves the slot, which
/// covers cancellation while the factory or cleanup is running.
struct PendingSlot<'a, F: SessionFactory> {
    pool: &'a Pool<F>,
    armed: bool,
}

impl<F: SessionFactory> PendingSlot<'_, F> {
    /// The caller already settled `pending` under the lock.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: SessionFactory> Drop for PendingSlot<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.inner.state.lock().pending -= 1;
            self.pool.maybe_fill();
        }
    }
}

/// A queued acquire. Dropping it while armed (the acquire was cancelled)
/// leaves the queue, and returns any session delivered in the meantime.
struct QueuedWaiter<'a, F: SessionFactory> {
    pool: &'a Pool<F>,
    arrival: u64,
    rx: oneshot::Receiver<F::Session>,
    armed: bool,
}

impl<F: SessionFactory> Drop for QueuedWaiter<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.pool.inner.state.lock().waiters.remove(self.arrival);
        if removed {
            tracing::trace!(waiter = self.arrival, "cancelled acquire left the queue");
            return;
        }
        if let Ok(session) = self.rx.try_recv() {
            tracing::debug!(session_id = %session.id(), "returning session delivered to a cancelled acquire");
            self.pool.return_unused(session);
        }
    }
}

/// A session checked out from a [`Pool`].
///
/// Dereferences to the underlying session. Call
/// [`release()`](PooledSession::release) to return it; a guard that is
/// dropped without being released is returned in the background.
pub struct PooledSession<F: SessionFactory> {
    session: Option<F::Session>,
    properties_before: SessionProperties,
    pool: Pool<F>,
}

impl<F: SessionFactory> PooledSession<F> {
    fn new(session: F::Session, pool: Pool<F>) -> Self {
        Self {
            properties_before: session.properties(),
            session: Some(session),
            pool,
        }
    }

    #[allow(clippy::expect_used)]
    fn session_ref(&self) -> &F::Session {
        self.session
            .as_ref()
            .expect("session is present until the guard is consumed")
    }

    #[allow(clippy::expect_used)]
    fn session_mut_ref(&mut self) -> &mut F::Session {
        self.session
            .as_mut()
            .expect("session is present until the guard is consumed")
    }

    #[allow(clippy::expect_used)]
    fn take_session(&mut self) -> F::Session {
        self.session
            .take()
            .expect("session is present until the guard is consumed")
    }

    /// Identifier of the checked-out session.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session_ref().id()
    }

    /// Property snapshot taken at checkout.
    #[must_use]
    pub fn properties_before(&self) -> &SessionProperties {
        &self.properties_before
    }

    /// The pool this session belongs to.
    #[must_use]
    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    /// Return the session to its pool.
    pub async fn release(mut self) -> Result<CheckIn> {
        let session = self.take_session();
        let before = std::mem::take(&mut self.properties_before);
        self.pool.release_session(session, &before).await
    }

    /// Remove the session from the pool's accounting and hand it to the
    /// caller, who becomes responsible for closing it.
    #[must_use]
    pub fn detach(mut self) -> F::Session {
        let session = self.take_session();
        self.pool.forget(session.id());
        session
    }

    /// Split into the raw session and its checkout snapshot. The session
    /// stays checked out; return it with [`Pool::release_session`].
    #[must_use]
    pub fn into_parts(mut self) -> (F::Session, SessionProperties) {
        let session = self.take_session();
        (session, std::mem::take(&mut self.properties_before))
    }
}

impl<F: SessionFactory> Deref for PooledSession<F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        self.session_ref()
    }
}

impl<F: SessionFactory> DerefMut for PooledSession<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session_mut_ref()
    }
}

impl<F: SessionFactory> fmt::Debug for PooledSession<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.session.as_ref().map(Session::id))
            .field("properties_before", &self.properties_before)
            .finish()
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.id();
        let before = std::mem::take(&mut self.properties_before);
        let pool = self.pool.clone();

        match Handle::try_current() {
            Ok(handle) => {
                tracing::trace!(session_id = %id, "returning dropped session to pool");
                handle.spawn(async move {
                    if let Err(e) = pool.release_session(session, &before).await {
                        tracing::warn!(session_id = %id, error = %e, "background release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %id,
                    "session dropped outside a runtime, removing it from the pool unclosed"
                );
                pool.forget(id);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestSession {
        id: SessionId,
        properties: SessionProperties,
    }

    #[async_trait::async_trait]
    impl Session for TestSession {
        fn id(&self) -> SessionId {
            self.id
        }

        fn is_established(&self) -> bool {
            true
        }

        fn properties(&self) -> SessionProperties {
            self.properties.clone()
        }
    }

    #[derive(Default)]
    struct TestFactory {
        next_id: AtomicU64,
        closed: AtomicU64,
    }

    #[async_trait::async_trait]
    impl SessionFactory for TestFactory {
        type Session = TestSession;

        async fn create_session(&self, _key: &PoolKey) -> std::result::Result<TestSession, BoxError> {
            Ok(TestSession {
                id: SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
                properties: SessionProperties::new().database("DB"),
            })
        }

        async fn close_session(&self, _session: TestSession) -> std::result::Result<(), BoxError> {
            self.closed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn pool(config: PoolConfig) -> Pool<TestFactory> {
        let key = PoolKey::parse("account=test").unwrap();
        Pool::new(key, config.min_pool_size(0), Arc::new(TestFactory::default())).unwrap()
    }

    #[tokio::test]
    async fn test_status_tracks_checkout_and_release() {
        let pool = pool(PoolConfig::new().max_pool_size(3));
        assert_eq!(pool.status().total, 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let status = pool.status();
        assert_eq!(status.in_use, 2);
        assert_eq!(status.idle, 0);
        assert_eq!(status.total, 2);

        assert_eq!(a.release().await.unwrap(), CheckIn::Idle);
        let status = pool.status();
        assert_eq!(status.in_use, 1);
        assert_eq!(status.idle, 1);

        b.release().await.unwrap();
        assert_eq!(pool.status().idle, 2);
        assert_eq!(pool.status().pending, 0);
    }

    #[tokio::test]
    async fn test_idle_reuse_is_lifo() {
        let pool = pool(PoolConfig::new().max_pool_size(3));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        a.release().await.unwrap();
        b.release().await.unwrap();

        let next = pool.acquire().await.unwrap();
        assert_eq!(next.id(), b_id);
        assert_ne!(next.id(), a_id);
    }

    #[tokio::test]
    async fn test_properties_before_snapshot() {
        let pool = pool(PoolConfig::new());
        let session = pool.acquire().await.unwrap();
        assert_eq!(
            session.properties_before(),
            &SessionProperties::new().database("DB")
        );
    }

    #[tokio::test]
    async fn test_detach_frees_the_slot() {
        let pool = pool(PoolConfig::new().max_pool_size(1));
        let session = pool.acquire().await.unwrap();
        let raw = session.detach();
        assert_eq!(pool.current_size(), 0);
        assert_eq!(raw.properties.database.as_deref(), Some("DB"));

        let again = pool.acquire().await.unwrap();
        assert_ne!(again.id(), raw.id);
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let pool = pool(PoolConfig::new().max_pool_size(1));
        assert!(pool.try_acquire().unwrap().is_none());

        let session = pool.acquire().await.unwrap();
        let id = session.id();
        assert!(pool.try_acquire().unwrap().is_none());
        session.release().await.unwrap();

        let idle = pool.try_acquire().unwrap().unwrap();
        assert_eq!(idle.id(), id);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = pool(PoolConfig::new());
        let session = pool.acquire().await.unwrap();
        pool.close().await;

        assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
        assert!(matches!(pool.try_acquire(), Err(PoolError::PoolClosed)));
        assert_eq!(session.release().await.unwrap(), CheckIn::Destroyed);
        assert_eq!(pool.factory().closed.load(Ordering::Relaxed), 1);
        assert_eq!(pool.current_size(), 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_is_returned_in_background() {
        let pool = pool(PoolConfig::new());
        let session = pool.acquire().await.unwrap();
        drop(session);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().in_use, 0);
    }
}
