//! Benchmarks for cache lock/unlock paths

use assetheap::{Cache, CacheConfig, CacheKey, FnSource, ResourceSource, SourceError};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn uniform_source(size: usize) -> impl ResourceSource {
    FnSource::new(
        move |_key: CacheKey| -> Result<usize, SourceError> { Ok(size) },
        |key: CacheKey, buf: &mut [u8]| -> Result<usize, SourceError> {
            buf.fill(key as u8);
            Ok(buf.len())
        },
    )
}

fn benchmark_lock_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lock_hit");

    for entries in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            let mut cache =
                Cache::new(CacheConfig::with_max_size(entries * 512), uniform_source(256)).unwrap();
            for key in 0..entries as CacheKey {
                let handle = cache.lock(key).unwrap();
                cache.unlock(handle).unwrap();
            }

            b.iter(|| {
                let handle = cache.lock(black_box(entries as CacheKey / 2)).unwrap();
                cache.unlock(handle).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_lock_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lock_evicting");

    for working_set in [4usize, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(working_set),
            working_set,
            |b, &working_set| {
                // Room for roughly half the working set at a time.
                let mut cache = Cache::new(
                    CacheConfig::with_max_size(working_set * 1024 / 2),
                    uniform_source(1000),
                )
                .unwrap();
                let mut key: CacheKey = 0;

                b.iter(|| {
                    let handle = cache.lock(key % working_set as CacheKey).unwrap();
                    cache.unlock(handle).unwrap();
                    key = key.wrapping_add(1);
                });
            },
        );
    }

    group.finish();
}

fn benchmark_random_access(c: &mut Criterion) {
    // About 90 of the 256 keys fit at once.
    let mut cache =
        Cache::new(CacheConfig::with_max_size(64 * 1024), uniform_source(700)).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    c.bench_function("cache_lock_random_256_keys", |b| {
        b.iter(|| {
            let key: CacheKey = rng.gen_range(0..256);
            let handle = cache.lock(key).unwrap();
            cache.unlock(handle).unwrap();
        });
    });
}

fn benchmark_flush(c: &mut Criterion) {
    c.bench_function("cache_fill_and_flush_256", |b| {
        let mut cache =
            Cache::new(CacheConfig::with_max_size(1024 * 1024), uniform_source(512)).unwrap();

        b.iter(|| {
            for key in 0..256 {
                let handle = cache.lock(key).unwrap();
                cache.unlock(handle).unwrap();
            }
            cache.flush();
            black_box(cache.total_size());
        });
    });
}

criterion_group!(
    benches,
    benchmark_lock_hit,
    benchmark_lock_with_eviction,
    benchmark_random_access,
    benchmark_flush
);
criterion_main!(benches);
