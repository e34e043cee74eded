//! Benchmark: offset index lookup vs linear list walk.
//!
//! Compares `OffsetIndex::find_closest` (O(log n)) against walking the
//! extent list's links (O(n)) for the lookup every read/write starts with.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_extent::{ExtentId, ExtentTable, FileTx, Inode, OffsetIndex};
use ember_txn::{Heap, HeapOptions};

const EXTENT_COUNT: u64 = 1024;

/// Build a fragmented file: every second granule allocated.
fn make_file() -> (Heap, ExtentTable, OffsetIndex) {
    let heap = Heap::new(HeapOptions {
        block_size: Some(0x1000),
        ..HeapOptions::default()
    })
    .expect("valid options");
    let g = u64::from(heap.granularity().get());
    let mut table = ExtentTable::new();
    let mut index = OffsetIndex::new();
    let mut inode = Inode::new();

    let mut tx = FileTx::begin(&heap);
    let mut after = None;
    for i in 0..EXTENT_COUNT {
        let payload = tx.alloc_payload(g as u32).expect("allocation");
        after = Some(tx.insert_extent(&mut table, after, i * 2 * g, g as u32, payload, 0));
    }
    tx.commit(&mut index, &mut inode);

    (heap, table, index)
}

/// Linear reference: last extent whose offset is <= the probe.
fn linear_find_closest(table: &ExtentTable, offset: u64) -> Option<ExtentId> {
    let mut best = None;
    let mut cursor = table.head();
    while let Some(id) = cursor {
        if table.get(id).offset > offset {
            break;
        }
        best = Some(id);
        cursor = table.next(id);
    }
    best
}

fn bench_find_closest(c: &mut Criterion) {
    let (heap, table, index) = make_file();
    let g = u64::from(heap.granularity().get());
    // Probe the middle of the file, between two extents.
    let probe = EXTENT_COUNT * g + g / 2;

    let mut group = c.benchmark_group("find_closest");

    group.bench_function("index_O(log_n)", |b| {
        b.iter(|| black_box(index.find_closest(black_box(probe))));
    });

    group.bench_function("list_walk_O(n)", |b| {
        b.iter(|| black_box(linear_find_closest(&table, black_box(probe))));
    });

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let (_heap, table, _index) = make_file();

    let mut group = c.benchmark_group("index_rebuild");

    group.bench_function("build_1024_extents", |b| {
        b.iter(|| black_box(OffsetIndex::build(black_box(&table), None).expect("build")));
    });

    group.finish();
}

criterion_group!(benches, bench_find_closest, bench_rebuild);
criterion_main!(benches);
