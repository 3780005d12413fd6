//! Benchmarks for the flush hot path.
//!
//! - `consolidate_all`: folding raw watcher events into per-path changes
//! - `album_tags`: deriving cache tags from a consolidated change set
//!
//! Run with `cargo bench -- consolidate` or `cargo bench -- album_tags`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mediadex::cache::album_tags;
use mediadex::watcher::{consolidate_all, RawChange, RawEventKind};

/// A burst shaped like a photo import: a few albums, many files, with some
/// churn (temporary files that appear and vanish, re-saved files).
fn import_burst(files: usize) -> Vec<RawChange> {
    let mut events = Vec::with_capacity(files * 2);
    for i in 0..files {
        let album = format!("2024/trip-{}/day-{}", i % 7, i % 31);
        if i % 50 == 0 {
            events.push(RawChange::new(RawEventKind::AddDir, album.clone()));
        }
        let path = format!("{album}/IMG_{i:05}.jpg");
        events.push(RawChange::new(RawEventKind::Add, path.clone()).with_hash(format!("{i:x}")));
        match i % 10 {
            0 => events.push(RawChange::new(RawEventKind::Unlink, path)),
            1 => events.push(RawChange::new(RawEventKind::Add, path).with_hash("resaved")),
            _ => {}
        }
    }
    events
}

fn bench_consolidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidate_all");
    group.sample_size(20);

    for size in [100, 1_000, 10_000] {
        let events = import_burst(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| consolidate_all(black_box(events.clone())));
        });
    }
    group.finish();
}

fn bench_album_tags(c: &mut Criterion) {
    let mut group = c.benchmark_group("album_tags");
    group.sample_size(20);

    for size in [100, 1_000, 10_000] {
        let changes = consolidate_all(import_burst(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &changes, |b, changes| {
            b.iter(|| album_tags(black_box(changes)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_consolidate, bench_album_tags);
criterion_main!(benches);
