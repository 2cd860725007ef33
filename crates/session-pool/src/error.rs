//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::SessionId;

/// Boxed error returned by a [`SessionFactory`](crate::SessionFactory) or a
/// session cleanup step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No session became available before the acquire deadline.
    #[error("no connection became available from the pool within {0:?}")]
    Timeout(Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The session factory failed to establish a new session.
    #[error("failed to create session: {0}")]
    SessionCreation(#[source] BoxError),

    /// Cleanup before reuse failed; the session was destroyed instead.
    #[error("session cleanup failed, session destroyed: {0}")]
    RecycleCleanup(#[source] BoxError),

    /// An administrative call is not supported in the current state.
    #[error("invalid administrative operation: {0}")]
    InvalidOperation(String),

    /// The released session is not checked out from this pool.
    #[error("session {id} is not owned by this pool or was already released")]
    SessionNotOwned {
        /// Identifier of the offending session.
        id: SessionId,
    },

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error is an acquire timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if a later attempt could succeed without any configuration change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::SessionCreation(_))
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_the_pool() {
        let err = PoolError::Timeout(Duration::from_secs(1));
        let msg = err.to_string();
        assert!(msg.contains("no connection became available from the pool"));
        assert!(msg.contains("1s"));
        assert!(err.is_timeout());
        assert!(err.is_transient());
    }

    #[test]
    fn test_not_owned_reports_id() {
        let err = PoolError::SessionNotOwned {
            id: SessionId::new(42),
        };
        assert!(err.to_string().contains("42"));
        assert!(!err.is_transient());
    }
}
