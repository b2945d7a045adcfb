//! Benchmarks for segment hot paths.
//!
//! - get on a populated segment (lookup + decode)
//! - put overwrite (allocation + write + old entry release)
//! - compute that leaves the value unchanged (metadata-only write)
//! - evict and refill under memory pressure
//!
//! Run with: cargo bench --bench segment

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use offheap_segment::{Computed, Segment, SegmentConfig, U64Serializer, VecSerializer};

fn make_value(size: usize) -> Vec<u8> {
    vec![0xAB; size]
}

fn populated(max_size: usize, items: u64, value_size: usize) -> Segment<u64, Vec<u8>> {
    let config = SegmentConfig::for_size(max_size);
    let source = config.page_source().unwrap();
    let segment = Segment::builder(config.engine(&source), U64Serializer, VecSerializer).build();

    let value = make_value(value_size);
    for key in 0..items {
        segment.put(&key, &value).unwrap();
    }
    segment
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment/get");

    for (items, value_size) in [(1_000u64, 64usize), (10_000, 64), (1_000, 1024)] {
        let segment = populated(64 * 1024 * 1024, items, value_size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("hit", format!("{}items_{}B", items, value_size)),
            &items,
            |b, &items| {
                let mut key = 0u64;
                b.iter(|| {
                    let result = segment.get(black_box(&key)).unwrap();
                    debug_assert!(result.is_some());
                    black_box(result);
                    key = (key + 1) % items;
                });
            },
        );
    }

    let segment = populated(64 * 1024 * 1024, 1_000, 64);
    group.bench_function("miss", |b| {
        let mut key = 1_000u64;
        b.iter(|| {
            black_box(segment.get(black_box(&key)).unwrap());
            key = 1_000 + (key + 1) % 1_000;
        });
    });

    group.finish();
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment/put");

    for value_size in [64usize, 1024] {
        let segment = populated(64 * 1024 * 1024, 1_000, value_size);
        let value = make_value(value_size);

        group.throughput(Throughput::Bytes(value_size as u64));
        group.bench_with_input(
            BenchmarkId::new("overwrite", format!("{}B", value_size)),
            &value_size,
            |b, _| {
                let mut key = 0u64;
                b.iter(|| {
                    segment.put(black_box(&key), black_box(&value)).unwrap();
                    key = (key + 1) % 1_000;
                });
            },
        );
    }

    group.finish();
}

fn bench_compute(c: &mut Criterion) {
    let segment = populated(64 * 1024 * 1024, 1_000, 64);

    c.bench_function("segment/compute/unchanged_pin", |b| {
        let mut key = 0u64;
        b.iter(|| {
            let result = segment
                .compute(black_box(&key), |_, _| Computed::Unchanged, true)
                .unwrap();
            black_box(result);
            key = (key + 1) % 1_000;
        });
    });
}

fn bench_evict(c: &mut Criterion) {
    let segment = populated(1024 * 1024, 4_000, 200);
    let value = make_value(200);

    c.bench_function("segment/evict_and_refill", |b| {
        let mut key = 4_000u64;
        b.iter(|| {
            if let Some(index) = segment.get_eviction_index() {
                black_box(segment.evict(index, true).unwrap());
            }
            let _ = segment.put(&key, &value);
            key += 1;
        });
    });
}

criterion_group!(benches, bench_get, bench_put, bench_compute, bench_evict);
criterion_main!(benches);
