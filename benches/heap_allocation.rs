//! Benchmarks for heap allocation and compaction

use assetheap::Heap;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn benchmark_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_allocate");

    for size in [64usize, 1024, 16 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut heap = Heap::new(1024 * 1024).unwrap();
                while let Ok(handle) = heap.allocate(black_box(size), false) {
                    black_box(handle);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_allocate_deallocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_allocate_deallocate");

    for count in [16usize, 256, 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut heap = Heap::new(4 * 1024 * 1024).unwrap();
            b.iter(|| {
                let handles: Vec<_> = (0..count)
                    .map(|i| heap.allocate(128 + (i % 7) * 32, false).unwrap())
                    .collect();
                for handle in handles {
                    heap.deallocate(handle).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_compaction");

    for blocks in [32usize, 128, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(blocks), blocks, |b, &blocks| {
            b.iter(|| {
                // Alternate free and movable blocks, pinning every eighth one so
                // that extents have free blocks outside of them.
                let block_size = 256;
                let mut heap = Heap::new(blocks * (block_size + 20)).unwrap();

                let handles: Vec<_> = (0..blocks)
                    .map(|_| heap.allocate(block_size, false).unwrap())
                    .collect();
                for (i, handle) in handles.iter().enumerate() {
                    if i % 2 == 0 {
                        heap.deallocate(*handle).unwrap();
                    } else if i % 8 == 7 {
                        heap.lock(*handle).unwrap();
                    }
                }

                black_box(heap.allocate(block_size * 3, false).ok());
            });
        });
    }

    group.finish();
}

fn benchmark_lock_unlock(c: &mut Criterion) {
    let mut heap = Heap::new(64 * 1024).unwrap();
    let handle = heap.allocate(4096, false).unwrap();

    c.bench_function("heap_lock_unlock", |b| {
        b.iter(|| {
            heap.lock(black_box(handle)).unwrap();
            black_box(heap.data(handle).unwrap()[0]);
            heap.unlock(handle).unwrap();
        });
    });
}

fn benchmark_validate(c: &mut Criterion) {
    let mut heap = Heap::new(1024 * 1024).unwrap();
    while heap.allocate(512, false).is_ok() {}

    c.bench_function("heap_validate_full", |b| {
        b.iter(|| black_box(heap.validate().is_ok()));
    });
}

criterion_group!(
    benches,
    benchmark_allocate,
    benchmark_allocate_deallocate,
    benchmark_compaction,
    benchmark_lock_unlock,
    benchmark_validate
);
criterion_main!(benches);
