//! In-memory session factory.
//!
//! Sessions never touch the network. Each [`MockSession`] shares its state
//! with the factory's record of it, so a test can change a session's context
//! after handing it to the pool and inspect it after the pool closed it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use session_pool::{BoxError, PoolKey, Session, SessionFactory, SessionId, SessionProperties};

/// Errors raised by the mock factory and its sessions.
#[derive(Debug, thiserror::Error)]
pub enum MockFactoryError {
    /// Injected session creation failure.
    #[error("mock session creation failed for {key}")]
    CreateFailed {
        /// Redacted key the session was requested for.
        key: String,
    },

    /// Injected close failure.
    #[error("mock close failed for session {0}")]
    CloseFailed(SessionId),

    /// Injected cleanup failure.
    #[error("mock cleanup failed for session {0}")]
    ResetFailed(SessionId),
}

#[derive(Debug)]
struct MockSessionState {
    properties: SessionProperties,
    established: bool,
    in_transaction: bool,
    fail_next_reset: bool,
    resets: u32,
}

/// A fake server session.
///
/// Clones share state: a clone kept by the test observes what the pool does
/// to the session and can change its context from outside.
#[derive(Debug, Clone)]
pub struct MockSession {
    id: SessionId,
    key: PoolKey,
    state: Arc<Mutex<MockSessionState>>,
}

impl MockSession {
    fn new(id: SessionId, key: PoolKey, properties: SessionProperties) -> Self {
        Self {
            id,
            key,
            state: Arc::new(Mutex::new(MockSessionState {
                properties,
                established: true,
                in_transaction: false,
                fail_next_reset: false,
                resets: 0,
            })),
        }
    }

    /// Key the session was created for.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Simulate `USE DATABASE`.
    pub fn set_database(&self, database: impl Into<String>) {
        self.state.lock().properties.database = Some(database.into());
    }

    /// Simulate `USE SCHEMA`.
    pub fn set_schema(&self, schema: impl Into<String>) {
        self.state.lock().properties.schema = Some(schema.into());
    }

    /// Simulate `USE ROLE`.
    pub fn set_role(&self, role: impl Into<String>) {
        self.state.lock().properties.role = Some(role.into());
    }

    /// Simulate `USE WAREHOUSE`.
    pub fn set_warehouse(&self, warehouse: impl Into<String>) {
        self.state.lock().properties.warehouse = Some(warehouse.into());
    }

    /// Replace the whole property snapshot.
    pub fn set_properties(&self, properties: SessionProperties) {
        self.state.lock().properties = properties;
    }

    /// Simulate the server dropping (or restoring) the session.
    pub fn set_established(&self, established: bool) {
        self.state.lock().established = established;
    }

    /// Open a transaction that cleanup must roll back.
    pub fn begin_transaction(&self) {
        self.state.lock().in_transaction = true;
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    /// Make the next cleanup fail.
    pub fn fail_next_reset(&self) {
        self.state.lock().fail_next_reset = true;
    }

    /// Number of cleanups attempted.
    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.state.lock().resets
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_established(&self) -> bool {
        self.state.lock().established
    }

    fn properties(&self) -> SessionProperties {
        self.state.lock().properties.clone()
    }

    async fn reset(&mut self) -> Result<(), BoxError> {
        let mut state = self.state.lock();
        state.resets += 1;
        if std::mem::take(&mut state.fail_next_reset) {
            return Err(Box::new(MockFactoryError::ResetFailed(self.id)));
        }
        state.in_transaction = false;
        Ok(())
    }
}

/// Builder for [`MockSessionFactory`].
#[derive(Debug, Clone, Default)]
pub struct MockFactoryBuilder {
    create_delay: Option<Duration>,
    initial_properties: SessionProperties,
}

impl MockFactoryBuilder {
    /// Delay every creation, to simulate network latency.
    #[must_use]
    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Context new sessions start with. A `db` or `database` key in the
    /// connection string overrides the database.
    #[must_use]
    pub fn initial_properties(mut self, properties: SessionProperties) -> Self {
        self.initial_properties = properties;
        self
    }

    /// Build the factory.
    #[must_use]
    pub fn build(self) -> MockSessionFactory {
        MockSessionFactory {
            next_id: AtomicU64::new(1),
            create_delay: self.create_delay,
            initial_properties: self.initial_properties,
            failing_creates: AtomicU32::new(0),
            failing_closes: AtomicU32::new(0),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }
}

/// Session factory backed by memory.
#[derive(Debug)]
pub struct MockSessionFactory {
    next_id: AtomicU64,
    create_delay: Option<Duration>,
    initial_properties: SessionProperties,
    failing_creates: AtomicU32,
    failing_closes: AtomicU32,
    created: Mutex<Vec<MockSession>>,
    closed: Mutex<Vec<SessionId>>,
}

impl MockSessionFactory {
    /// Factory with no delay and empty initial properties.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a factory.
    #[must_use]
    pub fn builder() -> MockFactoryBuilder {
        MockFactoryBuilder::default()
    }

    /// Make the next `count` creations fail.
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` closes fail.
    pub fn fail_next_closes(&self, count: u32) {
        self.failing_closes.store(count, Ordering::SeqCst);
    }

    /// Sessions created so far.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Sessions closed so far.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.closed.lock().len()
    }

    /// Sessions created and not yet closed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.created_count() - self.closed_count()
    }

    /// Identifiers of closed sessions, in close order.
    #[must_use]
    pub fn closed_ids(&self) -> Vec<SessionId> {
        self.closed.lock().clone()
    }

    /// Whether the session was closed.
    #[must_use]
    pub fn was_closed(&self, id: SessionId) -> bool {
        self.closed.lock().contains(&id)
    }

    /// A handle sharing state with a created session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<MockSession> {
        self.created.lock().iter().find(|s| s.id == id).cloned()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn create_session(&self, key: &PoolKey) -> Result<MockSession, BoxError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_creates) {
            tracing::debug!(pool = %key, "injected creation failure");
            return Err(Box::new(MockFactoryError::CreateFailed {
                key: key.to_string(),
            }));
        }

        let mut properties = self.initial_properties.clone();
        if let Some(database) = key.get("db").or_else(|| key.get("database")) {
            properties.database = Some(database.to_string());
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = MockSession::new(id, key.clone(), properties);
        self.created.lock().push(session.clone());
        tracing::trace!(session_id = %id, "mock session created");
        Ok(session)
    }

    async fn close_session(&self, session: MockSession) -> Result<(), BoxError> {
        session.set_established(false);
        self.closed.lock().push(session.id);
        if Self::take_failure(&self.failing_closes) {
            return Err(Box::new(MockFactoryError::CloseFailed(session.id)));
        }
        Ok(())
    }
}
