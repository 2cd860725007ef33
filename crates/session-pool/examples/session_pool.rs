//! Session pool walkthrough.
//!
//! Runs against the in-memory mock factory, so no server is needed:
//!
//! ```bash
//! RUST_LOG=session_pool=debug cargo run -p session-pool --example session_pool
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use session_pool::{ChangedSessionBehavior, PoolConfig, RegistryBuilder, Session, Topology};
use session_pool_testing::MockSessionFactory;
use session_pool_testing::fixtures::{conn_str, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let factory = MockSessionFactory::builder()
        .create_delay(Duration::from_millis(20))
        .build();
    let registry = RegistryBuilder::new()
        .topology(Topology::Keyed)
        .pool_config(PoolConfig::new().min_pool_size(1).max_pool_size(2))
        .eviction_interval(Duration::from_secs(5))
        .build(factory)?;

    let reporting = conn_str("reporting", &[("waitingForIdleSessionTimeout", "2")]);

    // Four workers contend for two sessions; the last two queue in order.
    let mut workers = Vec::new();
    for worker in 0..4 {
        let registry = registry.clone();
        let reporting = reporting.clone();
        workers.push(tokio::spawn(async move {
            let session = registry.acquire(&reporting).await?;
            println!("worker {worker} got session {}", session.id());
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.release().await
        }));
    }
    for worker in workers {
        worker.await??;
    }

    let pool = registry.get_pool(&reporting)?;
    println!("after workers: {:?}", pool.status());

    // A session whose database changed is not reused.
    let session = registry.acquire(&reporting).await?;
    session.set_database("SCRATCH");
    println!("changed session released: {:?}", session.release().await?);

    // Unless the pool keeps changed sessions.
    registry.set_changed_session(ChangedSessionBehavior::OriginalPool)?;
    let session = registry.acquire(&reporting).await?;
    session.set_database("SCRATCH");
    println!("changed session released: {:?}", session.release().await?);

    let metrics = pool.metrics();
    println!(
        "created {} closed {} hand-offs {} success rate {:.2}",
        metrics.sessions_created,
        metrics.sessions_closed,
        metrics.hand_offs,
        metrics.checkout_success_rate()
    );

    registry.clear_all_pools().await?;
    println!("pools cleared, live sessions: {}", registry.factory().live_count());
    Ok(())
}
