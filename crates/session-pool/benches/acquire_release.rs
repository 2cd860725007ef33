//! Benchmarks for the pool's acquire/release hot path and key parsing.

#![allow(missing_docs, clippy::unwrap_used)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use session_pool::{
    ChangedSessionBehavior, Pool, PoolConfig, PoolKey, SessionProperties, recycle,
};
use session_pool_testing::MockSessionFactory;

/// Connection-string parsing runs on every registry lookup.
fn bench_key_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_key");

    let short = "account=acme;user=etl;password=secret";
    group.throughput(Throughput::Bytes(short.len() as u64));
    group.bench_function("short", |b| {
        b.iter(|| black_box(PoolKey::parse(black_box(short))))
    });

    let long = "account=acme;user=etl;password=secret;db=SALES;schema=PUBLIC;\
                role=LOADER;warehouse=XL;maxPoolSize=8;minPoolSize=2;\
                waitingForIdleSessionTimeout=30;expirationTimeout=600;\
                changedSession=OriginalPool";
    group.throughput(Throughput::Bytes(long.len() as u64));
    group.bench_function("with_pool_settings", |b| {
        b.iter(|| black_box(PoolKey::parse(black_box(long))))
    });

    group.finish();
}

/// The recycle decision runs on every release.
fn bench_recycle_decision(c: &mut Criterion) {
    let before = SessionProperties::new()
        .database("SALES")
        .schema("PUBLIC")
        .role("LOADER")
        .warehouse("XL");
    let same_case_folded = SessionProperties::new()
        .database("sales")
        .schema("public")
        .role("loader")
        .warehouse("xl");

    c.bench_function("recycle_decide_unchanged", |b| {
        b.iter(|| {
            black_box(recycle::decide(
                black_box(&before),
                black_box(&same_case_folded),
                ChangedSessionBehavior::Destroy,
            ))
        })
    });
}

/// Checkout of an idle session followed by its release.
fn bench_acquire_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let pool = runtime.block_on(async {
        Pool::new(
            PoolKey::parse("account=acme;user=etl").unwrap(),
            PoolConfig::new().min_pool_size(0).max_pool_size(4),
            Arc::new(MockSessionFactory::new()),
        )
        .unwrap()
    });

    c.bench_function("acquire_release_idle", |b| {
        b.to_async(&runtime).iter(|| async {
            let session = pool.acquire().await.unwrap();
            black_box(session.id());
            session.release().await.unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_key_parsing,
    bench_recycle_decision,
    bench_acquire_release
);
criterion_main!(benches);
