//! Performance benchmarks for tandem-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tandem_engine::{
    patch_from_value, ChangeEntry, ChangeLog, ConflictResolver, MemoryAuthority, Op, Schema,
    VersionedStore, Watermark,
};

fn create(i: u64, origin: &str) -> ChangeEntry {
    ChangeEntry::new(
        "tickets",
        format!("t_{i}"),
        Op::Create,
        patch_from_value(json!({"title": format!("Ticket {i}"), "status": "open"}))
            .unwrap_or_default(),
        i + 1,
        origin,
        1000,
    )
}

fn populated_store(size: u64) -> VersionedStore {
    let mut store = VersionedStore::new();
    for i in 0..size {
        let _ = store.apply(create(i, "node1"));
    }
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("apply_create", |b| {
        let mut store = VersionedStore::new();
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            store.apply(black_box(create(id, "node1")))
        })
    });

    group.bench_function("apply_concurrent_update", |b| {
        let mut store = populated_store(1);
        let mut clock = 1u64;

        b.iter(|| {
            clock += 1;
            let origin = if clock % 2 == 0 { "node1" } else { "node2" };
            let entry = ChangeEntry::new(
                "tickets",
                "t_0",
                Op::Update,
                patch_from_value(json!({"status": clock})).unwrap_or_default(),
                clock / 2,
                origin,
                1000,
            );
            store.apply(black_box(entry))
        })
    });

    group.bench_function("get_record", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get(black_box("tickets"), black_box("t_500")))
    });

    group.bench_function("records_all", |b| {
        let store = populated_store(1000);
        b.iter(|| store.records(black_box("tickets")))
    });

    group.finish();
}

fn bench_changelog(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog");

    for size in [100u64, 1000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("entries_since", size), size, |b, &size| {
            let mut log = ChangeLog::new("node1");
            for i in 0..size {
                let _ = log.append(
                    "tickets",
                    format!("t_{i}"),
                    Op::Update,
                    patch_from_value(json!({"status": "open"})).unwrap_or_default(),
                    1000,
                );
            }
            let watermark: Watermark = [("tickets", size / 2)].into_iter().collect();

            b.iter(|| log.entries_since(black_box(&watermark)).count())
        });
    }

    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let local = ChangeEntry::new(
        "tickets",
        "t1",
        Op::Update,
        patch_from_value(json!({"title": "Bar", "priority": "high"})).unwrap_or_default(),
        6,
        "A",
        0,
    );
    let remote = ChangeEntry::new(
        "tickets",
        "t1",
        Op::Update,
        patch_from_value(json!({"status": "closed", "priority": "low"})).unwrap_or_default(),
        6,
        "B",
        0,
    );

    c.bench_function("resolve_field_merge", |b| {
        b.iter(|| ConflictResolver.resolve(black_box(&local), black_box(&remote)))
    });
}

fn bench_authority(c: &mut Criterion) {
    let mut group = c.benchmark_group("authority");

    for size in [10u64, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("accept_and_pull", size), size, |b, &size| {
            let batch: Vec<ChangeEntry> = (0..size).map(|i| create(i, "node1")).collect();

            b.iter(|| {
                let mut authority = MemoryAuthority::new(Schema::tickets());
                let _ = authority.accept(black_box(&batch));
                authority.pull(&Watermark::new(), Some(100))
            })
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100u64, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("export", size), size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| store.export_state())
        });

        group.bench_with_input(BenchmarkId::new("import", size), size, |b, &size| {
            let snapshot = populated_store(size).export_state();
            b.iter(|| {
                let mut new_store = VersionedStore::new();
                new_store.import_state(black_box(snapshot.clone()))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_changelog,
    bench_resolver,
    bench_authority,
    bench_snapshot,
);
criterion_main!(benches);
