//! Registry and topology tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use session_pool::{
    ChangedSessionBehavior, CheckIn, PoolConfig, PoolError, PoolKey, Registry, RegistryBuilder,
    Session, Topology,
};
use session_pool_testing::fixtures::{ALICE, BOB, conn_str, init_tracing};
use session_pool_testing::MockSessionFactory;

fn registry(topology: Topology) -> Registry<MockSessionFactory> {
    init_tracing();
    RegistryBuilder::new()
        .topology(topology)
        .pool_config(PoolConfig::new().min_pool_size(0))
        .build(MockSessionFactory::new())
        .unwrap()
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Keyed topology
// =============================================================================

#[tokio::test]
async fn test_keyed_pool_reuses_session_across_connections() {
    let registry = registry(Topology::Keyed);
    let single = conn_str("alice", &[("maxPoolSize", "1")]);

    let session = registry.acquire(&single).await.unwrap();
    let id = session.id();
    session.release().await.unwrap();
    assert_eq!(registry.current_pool_size(), 1);

    let session = registry.acquire(&single).await.unwrap();
    assert_eq!(session.id(), id);
    assert_eq!(registry.current_pool_size(), 1);
    assert_eq!(registry.factory().created_count(), 1);
}

#[tokio::test]
async fn test_keyed_pools_are_isolated() {
    let registry = registry(Topology::Keyed);

    let alice = registry.acquire(ALICE).await.unwrap();
    let alice_id = alice.id();
    alice.release().await.unwrap();

    let bob = registry.acquire(BOB).await.unwrap();
    assert_ne!(bob.id(), alice_id);
    assert_eq!(registry.pool_count(), 2);
    assert_ne!(registry.get_pool(ALICE).unwrap().key(), registry.get_pool(BOB).unwrap().key());
}

#[tokio::test]
async fn test_equivalent_connection_strings_share_a_pool() {
    let registry = registry(Topology::Keyed);

    let a = registry.get_pool(ALICE).unwrap();
    let b = registry
        .get_pool("ACCOUNT=acme; User=alice ;PASSWORD=alice-secret;db=SALES")
        .unwrap();
    assert_eq!(a.key(), b.key());
    assert_eq!(registry.pool_count(), 1);
}

#[tokio::test]
async fn test_connection_string_overrides_defaults() {
    let registry = registry(Topology::Keyed);

    let pool = registry
        .get_pool(&conn_str(
            "carol",
            &[
                ("maxPoolSize", "4"),
                ("waitingForIdleSessionTimeout", "2"),
                ("changedSession", "OriginalPool"),
            ],
        ))
        .unwrap();
    let config = pool.config();
    assert_eq!(config.max_pool_size, 4);
    assert_eq!(config.wait_timeout, Duration::from_secs(2));
    assert_eq!(config.changed_session, ChangedSessionBehavior::OriginalPool);

    assert_eq!(registry.get_pool(ALICE).unwrap().config(), registry.defaults());
}

#[tokio::test]
async fn test_malformed_connection_string_is_rejected() {
    let registry = registry(Topology::Keyed);
    assert!(matches!(
        registry.get_pool("account=acme;garbage"),
        Err(PoolError::Configuration(_))
    ));
    assert!(registry.get_pool(&conn_str("dave", &[("maxPoolSize", "lots")])).is_err());
}

#[tokio::test]
async fn test_changed_session_destroyed_under_keyed_default() {
    let registry = registry(Topology::Keyed);

    let session = registry.acquire(ALICE).await.unwrap();
    session.set_schema("SCRATCH");
    assert_eq!(session.release().await.unwrap(), CheckIn::Destroyed);
    assert_eq!(registry.current_pool_size(), 0);
}

// =============================================================================
// Single-shared topology
// =============================================================================

#[tokio::test]
async fn test_single_pool_serves_every_connection_string() {
    let registry = registry(Topology::SingleShared);

    let alice = registry.acquire(ALICE).await.unwrap();
    let id = alice.id();
    alice.release().await.unwrap();

    let bob = registry.acquire(BOB).await.unwrap();
    assert_eq!(bob.id(), id);
    assert_eq!(registry.pool_count(), 1);
    assert!(registry.get_pool(ALICE).unwrap().key().is_empty());
}

#[tokio::test]
async fn test_single_pool_handle_connects_with_caller_key() {
    let registry = registry(Topology::SingleShared);
    let alice = PoolKey::parse(ALICE).unwrap();

    let session = registry.get_pool(ALICE).unwrap().acquire().await.unwrap();
    assert_eq!(session.key(), &alice);
    session.release().await.unwrap();

    // The filler connects with the key of the last caller.
    registry.set_min_pool_size(3).unwrap();
    settle().await;
    assert_eq!(registry.current_pool_size(), 3);

    let bob_pool = registry.get_pool(BOB).unwrap();
    let mut held = Vec::new();
    for _ in 0..3 {
        let session = bob_pool.acquire().await.unwrap();
        assert_eq!(session.key(), &alice);
        held.push(session);
    }
    assert_eq!(registry.factory().created_count(), 3);
}

#[tokio::test]
async fn test_shared_pool_handle_without_key_rejects_acquire() {
    let registry = registry(Topology::SingleShared);
    let pool = registry.pools().remove(0);

    assert!(matches!(
        pool.acquire().await,
        Err(PoolError::InvalidOperation(_))
    ));
    assert_eq!(registry.factory().created_count(), 0);

    let session = pool.acquire_for(&PoolKey::parse(BOB).unwrap()).await.unwrap();
    assert_eq!(session.key(), &PoolKey::parse(BOB).unwrap());
}

#[tokio::test]
async fn test_single_pool_ignores_connection_string_pool_keys() {
    let registry = registry(Topology::SingleShared);
    let pool = registry
        .get_pool(&conn_str("alice", &[("maxPoolSize", "1")]))
        .unwrap();
    assert_eq!(pool.config().max_pool_size, registry.max_pool_size());
    assert_eq!(registry.max_pool_size(), 10);
}

#[tokio::test]
async fn test_original_pool_mode_under_single_topology() {
    let registry = registry(Topology::SingleShared);
    registry
        .set_changed_session(ChangedSessionBehavior::OriginalPool)
        .unwrap();

    let session = registry.acquire(ALICE).await.unwrap();
    session.set_database("OTHER");
    session.set_warehouse("XL");
    assert_eq!(session.release().await.unwrap(), CheckIn::Idle);
    assert_eq!(registry.current_pool_size(), 1);
}

// =============================================================================
// Topology switching and reset
// =============================================================================

#[tokio::test]
async fn test_set_same_topology_is_a_no_op() {
    let registry = registry(Topology::Keyed);
    let pool = registry.get_pool(ALICE).unwrap();

    registry.set_topology(Topology::Keyed).await.unwrap();
    assert!(!pool.is_closed());
    assert_eq!(registry.pool_count(), 1);

    registry.force_topology(Topology::Keyed).await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(registry.pool_count(), 0);
}

#[tokio::test]
async fn test_switching_topology_discards_pools() {
    let registry = registry(Topology::Keyed);
    let session = registry.acquire(ALICE).await.unwrap();
    session.release().await.unwrap();
    let keyed = registry.get_pool(ALICE).unwrap();

    registry.set_topology(Topology::SingleShared).await.unwrap();
    assert_eq!(registry.topology(), Topology::SingleShared);
    assert!(keyed.is_closed());
    assert_eq!(registry.factory().closed_count(), 1);
    assert_eq!(registry.current_pool_size(), 0);
}

#[tokio::test]
async fn test_clear_all_pools() {
    let registry = registry(Topology::Keyed);
    let session = registry.acquire(ALICE).await.unwrap();
    session.release().await.unwrap();
    assert_eq!(registry.current_pool_size(), 1);

    registry.clear_all_pools().await.unwrap();
    assert_eq!(registry.topology(), Topology::Keyed);
    assert_eq!(registry.get_pool(ALICE).unwrap().current_size(), 0);
    assert_eq!(registry.factory().live_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleared_pool_is_empty_with_default_settings() {
    init_tracing();
    let registry = Registry::new(MockSessionFactory::new()).unwrap();
    assert_eq!(registry.min_pool_size(), 1);

    for _ in 0..100 {
        let session = registry.acquire(ALICE).await.unwrap();
        session.release().await.unwrap();

        registry.clear_all_pools().await.unwrap();
        assert_eq!(registry.get_pool(ALICE).unwrap().current_size(), 0);
        assert_eq!(registry.current_pool_size(), 0);
    }
}

#[tokio::test]
async fn test_registry_pool_fills_after_first_checkout() {
    init_tracing();
    let registry = RegistryBuilder::new()
        .pool_config(PoolConfig::new().min_pool_size(2))
        .build(MockSessionFactory::new())
        .unwrap();

    let pool = registry.get_pool(ALICE).unwrap();
    settle().await;
    assert_eq!(pool.current_size(), 0);

    pool.acquire().await.unwrap().release().await.unwrap();
    settle().await;
    assert_eq!(pool.current_size(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_does_not_undo_concurrent_topology_switch() {
    init_tracing();
    let registry = registry(Topology::Keyed);

    for _ in 0..100 {
        registry.set_topology(Topology::Keyed).await.unwrap();
        registry.get_pool(ALICE).unwrap();

        let clear = tokio::spawn({
            let registry = registry.clone();
            async move { registry.clear_all_pools().await }
        });
        let switch = tokio::spawn({
            let registry = registry.clone();
            async move { registry.set_topology(Topology::SingleShared).await }
        });
        clear.await.unwrap().unwrap();
        switch.await.unwrap().unwrap();

        assert_eq!(registry.topology(), Topology::SingleShared);
        assert_eq!(registry.pool_count(), 1);
    }
}

#[tokio::test]
async fn test_snapshot_and_restore() {
    let registry = registry(Topology::Keyed);
    let snapshot = registry.snapshot();

    registry.set_topology(Topology::SingleShared).await.unwrap();
    registry.set_max_pool_size(3).unwrap();
    registry.set_wait_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(registry.max_pool_size(), 3);

    registry.restore(snapshot.clone()).await.unwrap();
    assert_eq!(registry.topology(), Topology::Keyed);
    assert_eq!(registry.snapshot(), snapshot);
    assert_eq!(registry.max_pool_size(), 10);
    assert_eq!(registry.wait_timeout(), Duration::from_secs(30));
}

#[tokio::test]
async fn test_acquire_retries_after_pool_replaced() {
    init_tracing();
    let registry = RegistryBuilder::new()
        .pool_config(PoolConfig::new().min_pool_size(0).max_pool_size(1))
        .build(MockSessionFactory::new())
        .unwrap();
    let held = registry.acquire(ALICE).await.unwrap();

    let waiter = tokio::spawn({
        let registry = registry.clone();
        async move { registry.acquire(ALICE).await.map(|s| s.id()) }
    });
    settle().await;
    assert_eq!(registry.get_pool(ALICE).unwrap().status().waiting, 1);

    registry.clear_all_pools().await.unwrap();
    let served = waiter.await.unwrap().unwrap();
    assert_ne!(served, held.id());
    assert_eq!(held.release().await.unwrap(), CheckIn::Destroyed);
}

// =============================================================================
// Administrative settings
// =============================================================================

#[tokio::test]
async fn test_keyed_setters_reach_existing_and_new_pools() {
    let registry = registry(Topology::Keyed);
    let existing = registry.get_pool(ALICE).unwrap();

    registry.set_max_pool_size(7).unwrap();
    registry.set_min_pool_size(0).unwrap();
    registry
        .set_expiration_timeout(Some(Duration::from_secs(45)))
        .unwrap();

    assert_eq!(existing.config().max_pool_size, 7);
    assert_eq!(existing.config().expiration_timeout, Some(Duration::from_secs(45)));
    assert_eq!(registry.get_pool(BOB).unwrap().config().max_pool_size, 7);
    assert_eq!(registry.max_pool_size(), 7);
    assert_eq!(registry.min_pool_size(), 0);
    assert_eq!(registry.expiration_timeout(), Some(Duration::from_secs(45)));
}

#[tokio::test]
async fn test_invalid_max_is_rejected() {
    let registry = registry(Topology::Keyed);
    assert!(matches!(
        registry.set_max_pool_size(0),
        Err(PoolError::Configuration(_))
    ));
    assert_eq!(registry.max_pool_size(), 10);
}

#[tokio::test]
async fn test_disabling_pooling_rejected_under_keyed() {
    let registry = registry(Topology::Keyed);
    assert!(matches!(
        registry.set_pooling(false),
        Err(PoolError::InvalidOperation(_))
    ));
    assert!(registry.pooling_enabled());
    registry.set_pooling(true).unwrap();
}

#[tokio::test]
async fn test_disabling_pooling_under_single_topology() {
    let registry = registry(Topology::SingleShared);
    let session = registry.acquire(ALICE).await.unwrap();
    session.release().await.unwrap();

    registry.set_pooling(false).unwrap();
    assert!(!registry.pooling_enabled());
    settle().await;
    assert_eq!(registry.current_pool_size(), 0);

    let session = registry.acquire(ALICE).await.unwrap();
    assert_eq!(registry.current_pool_size(), 0);
    assert_eq!(session.release().await.unwrap(), CheckIn::Destroyed);

    registry.set_pooling(true).unwrap();
    assert_eq!(registry.max_pool_size(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_expiration_change_applies_through_scheduler() {
    init_tracing();
    let registry = RegistryBuilder::new()
        .pool_config(PoolConfig::new().min_pool_size(0).expiration_timeout(None))
        .eviction_interval(Duration::from_secs(1))
        .build(MockSessionFactory::new())
        .unwrap();

    let session = registry.acquire(ALICE).await.unwrap();
    session.release().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(registry.current_pool_size(), 1);

    registry
        .set_expiration_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(registry.current_pool_size(), 0);
    assert_eq!(registry.factory().closed_count(), 1);
}

#[tokio::test]
async fn test_zero_eviction_interval_is_rejected() {
    let result = RegistryBuilder::new()
        .eviction_interval(Duration::ZERO)
        .build(MockSessionFactory::new());
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}
