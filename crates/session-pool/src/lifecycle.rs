//! Session lifecycle management.
//!
//! This module defines the traits the pool uses to talk to the driver
//! (establishing, cleaning and closing server sessions) and the metadata the
//! pool keeps for every session it tracks.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::BoxError;
use crate::key::PoolKey;
use crate::recycle::SessionProperties;

/// Opaque, unique identifier of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An established server session.
///
/// The pool never interprets the session's protocol. It only reads the
/// identifier, the liveness flag and the property snapshot, and asks the
/// session to clean itself before it re-enters the pool.
#[async_trait::async_trait]
pub trait Session: Send + 'static {
    /// Unique identifier of this session.
    fn id(&self) -> SessionId;

    /// Whether the server side of the session is still usable.
    fn is_established(&self) -> bool;

    /// Snapshot of the server-confirmed context.
    fn properties(&self) -> SessionProperties;

    /// Bring the session back to a clean state before reuse.
    ///
    /// Typically rolls back a pending transaction. An error makes the pool
    /// destroy the session instead of keeping it.
    async fn reset(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Gateway that opens and closes server sessions.
///
/// Both calls are slow network I/O; the pool never invokes them while
/// holding its lock.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type produced by this factory.
    type Session: Session;

    /// Establish a new session for `key`.
    async fn create_session(&self, key: &PoolKey) -> Result<Self::Session, BoxError>;

    /// Close a session. Best effort: failures are logged by the pool.
    async fn close_session(&self, session: Self::Session) -> Result<(), BoxError>;
}

/// State of a session tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Session is idle and available for checkout.
    Idle,
    /// Session is owned by exactly one caller.
    Busy,
}

/// Pool-local metadata about a tracked session.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    /// When the session was created.
    pub created_at: Instant,
    /// When the session last entered the idle set.
    pub entered_idle_at: Option<Instant>,
    /// Number of times the session has been checked out.
    pub checkout_count: u64,
    /// Current state of the session.
    pub state: EntryState,
}

impl EntryMetadata {
    /// Metadata for a session that was just created for a caller.
    pub fn new_busy(now: Instant) -> Self {
        Self {
            created_at: now,
            entered_idle_at: None,
            checkout_count: 1,
            state: EntryState::Busy,
        }
    }

    /// Metadata for a session created by the background filler.
    pub fn new_idle(now: Instant) -> Self {
        Self {
            created_at: now,
            entered_idle_at: Some(now),
            checkout_count: 0,
            state: EntryState::Idle,
        }
    }

    /// Mark the session as checked out.
    pub fn mark_checkout(&mut self) {
        self.entered_idle_at = None;
        self.checkout_count += 1;
        self.state = EntryState::Busy;
    }

    /// Mark the session as returned to idle.
    pub fn mark_checkin(&mut self, now: Instant) {
        self.entered_idle_at = Some(now);
        self.state = EntryState::Idle;
    }

    /// Check if the session has been idle for at least `timeout`.
    #[must_use]
    pub fn is_idle_expired(&self, now: Instant, timeout: Duration) -> bool {
        match (self.state, self.entered_idle_at) {
            (EntryState::Idle, Some(since)) => now.saturating_duration_since(since) >= timeout,
            _ => false,
        }
    }
}
