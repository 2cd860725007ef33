//! # session-pool
//!
//! Session pooling core for database client drivers.
//!
//! A driver plugs in a [`SessionFactory`] that opens and closes server
//! sessions; this crate decides when sessions are created, reused, handed
//! to waiting callers, evicted, and destroyed.
//!
//! ## Features
//!
//! - Per-connection-string pools, or one pool shared by every caller
//! - Strict FIFO hand-off to callers blocked on a full pool
//! - Recycle policy that destroys sessions whose database, schema, role or
//!   warehouse changed while checked out
//! - Session cleanup before reuse, idle expiration, background min-size fill
//! - Pool settings from connection-string keys, adjustable at runtime
//!
//! ## Example
//!
//! ```rust,ignore
//! use session_pool::{Registry, RegistryBuilder, Topology};
//!
//! let registry = RegistryBuilder::new()
//!     .topology(Topology::Keyed)
//!     .build(factory)?;
//!
//! let session = registry
//!     .acquire("account=acme;user=etl;maxPoolSize=4")
//!     .await?;
//! // Use session...
//! session.release().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod eviction;
pub mod key;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod recycle;
pub mod registry;
mod wait_queue;

pub use config::PoolConfig;
pub use error::{BoxError, PoolError, Result};
pub use eviction::EvictionScheduler;
pub use key::PoolKey;
pub use lifecycle::{EntryMetadata, EntryState, Session, SessionFactory, SessionId};
pub use metrics::{PoolMetrics, PoolStatus};
pub use pool::{CheckIn, Pool, PooledSession};
pub use recycle::{ChangedSessionBehavior, Recycle, SessionProperties};
pub use registry::{Registry, RegistryBuilder, RegistrySnapshot, Topology};
