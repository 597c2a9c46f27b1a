use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use statshub::auth::{expected_hash, verify, UserInfo};
use statshub::hub::StatsHub;
use statshub::stats::{StatsBundle, StatsSubmission};
use statshub::store::MemoryStore;

fn typical_update() -> StatsBundle {
    let mut bundle = StatsBundle::new();
    for i in 0..16 {
        bundle = bundle
            .with_counter(&format!("feature_{i}_uses"), i64::from(i) + 1)
            .with_gauge(&format!("setting_{i}"), i64::from(i) * 10);
    }
    bundle.with_presence("dark_mode", 1)
}

fn bench_merge(c: &mut Criterion) {
    let update = typical_update();
    let mut existing = typical_update();

    c.bench_function("stats/merge_33_keys", |b| {
        b.iter(|| existing.merge(black_box(&update)))
    });
}

fn bench_auth(c: &mut Criterion) {
    let info = UserInfo {
        user_id: 523_523,
        hash: expected_hash("bob@example.com", 523_523),
    };

    c.bench_function("auth/expected_hash", |b| {
        b.iter(|| expected_hash(black_box("bob@example.com"), black_box(523_523)))
    });

    c.bench_function("auth/verify", |b| {
        b.iter(|| verify(black_box(&info), black_box("bob@example.com")).expect("verified"))
    });
}

fn bench_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let hub = StatsHub::new(Arc::new(MemoryStore::new()));
    let submission = StatsSubmission {
        country_code: Some("es".to_string()),
        stats: typical_update(),
    };

    c.bench_function("hub/submit_with_country", |b| {
        b.iter(|| {
            rt.block_on(hub.submit(black_box(42), black_box(&submission)))
                .expect("submit")
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_merge(c);
    bench_auth(c);
    bench_submit(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
