//! Profile store throughput benchmark (Sprint 2)
//!
//! Measures the operations on the request path of a profiled application:
//!
//! 1. `store.put(profile)` - insert after a request completes
//! 2. `store.get(id)` - lookup by the result-fetch endpoint
//! 3. `store.evict_expired(..)` - one eviction pass over a populated store
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench store_throughput
//! ```

use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use miniprof::context::InstrumentationContext;
use miniprof::profile::Profile;
use miniprof::store::ProfileStore;

/// A finished profile with a small tree, `age` old
fn bench_profile(age: Duration) -> Profile {
    let mut ctx = InstrumentationContext::new(Profile::create_at(
        "GET http://localhost/api/items",
        SystemTime::now() - age,
    ));
    ctx.with_child("load", |ctx| {
        ctx.record_sub_event("SELECT * FROM items", Duration::from_micros(150));
        ctx.with_child("render", |_| {});
    });
    ctx.finish_with(Duration::from_millis(3))
}

fn bench_put(c: &mut Criterion) {
    let store = ProfileStore::new();
    c.bench_function("store_put", |b| {
        b.iter_batched(
            || bench_profile(Duration::ZERO),
            |profile| black_box(store.put(profile)),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_get");
    for size in [100usize, 10_000] {
        let store = ProfileStore::new();
        let ids: Vec<_> = (0..size)
            .filter_map(|_| store.put(bench_profile(Duration::ZERO)).ok())
            .map(|p| p.id().clone())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % ids.len();
                black_box(store.get(&ids[i]))
            })
        });
    }
    group.finish();
}

fn bench_eviction_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_evict_expired");
    for size in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let store = ProfileStore::new();
                    for i in 0..size {
                        // half the profiles are past retention
                        let age = if i % 2 == 0 { 48 * 3600 } else { 60 };
                        let _ = store.put(bench_profile(Duration::from_secs(age)));
                    }
                    store
                },
                |store| black_box(store.evict_expired(SystemTime::now(), Duration::from_secs(24 * 3600))),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_eviction_pass);
criterion_main!(benches);
