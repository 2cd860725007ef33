//! # session-pool-testing
//!
//! Test infrastructure for the session pool.
//!
//! ## Features
//!
//! - In-memory session factory with injectable creation delays and failures
//! - Mock sessions whose context, liveness and cleanup outcome tests control
//! - Connection-string fixtures and tracing setup
//!
//! ## Example
//!
//! ```rust,ignore
//! use session_pool::{Pool, PoolConfig, PoolKey};
//! use session_pool_testing::MockSessionFactory;
//!
//! #[tokio::test]
//! async fn test_with_mock_factory() {
//!     let factory = Arc::new(MockSessionFactory::new());
//!     let pool = Pool::new(PoolKey::default(), PoolConfig::new(), factory.clone()).unwrap();
//!
//!     let session = pool.acquire().await.unwrap();
//!     session.set_database("OTHER");
//!     session.release().await.unwrap();
//!     assert_eq!(factory.closed_count(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_factory;

pub use mock_factory::{
    MockFactoryBuilder, MockFactoryError, MockSession, MockSessionFactory,
};
