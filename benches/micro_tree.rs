//! Micro benchmarks for the copy-on-write tree containers.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use cowtree::{AllocationBitmap, BlockStore, CowMap, CtrId, MemStore};

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;
const BITMAP_BITS: u64 = 1 << 20;

fn fresh_map() -> CowMap {
    let store: Arc<dyn BlockStore> = Arc::new(MemStore::default());
    CowMap::create(store, CtrId(1)).expect("map")
}

fn loaded_map(count: u64) -> CowMap {
    let mut map = fresh_map();
    for key in 0..count {
        map.insert(key, key).expect("insert");
    }
    map
}

fn micro_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/map");
    group.sample_size(30);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            fresh_map,
            |mut map| {
                for key in 0..INSERT_COUNT {
                    map.insert(key, key).expect("insert");
                }
                black_box(map.tree().root());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            fresh_map,
            |mut map| {
                for key in &random_keys {
                    map.insert(*key, *key).expect("insert");
                }
                black_box(map.tree().root());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("batch_insert", |b| {
        b.iter_batched(
            fresh_map,
            |mut map| {
                let added = map
                    .insert_batch(random_keys.iter().map(|key| (*key, *key)))
                    .expect("insert_batch");
                black_box(added);
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT / 2));
    group.bench_function("remove_range_half", |b| {
        b.iter_batched(
            || loaded_map(INSERT_COUNT),
            |mut map| {
                let removed = map
                    .remove_range(INSERT_COUNT / 4..INSERT_COUNT * 3 / 4)
                    .expect("remove_range");
                black_box(removed);
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("delete_random", |b| {
        b.iter_batched(
            || loaded_map(INSERT_COUNT),
            |mut map| {
                for key in &random_keys {
                    map.remove(*key).expect("remove");
                }
                black_box(map.tree().root());
            },
            BatchSize::SmallInput,
        );
    });

    let base = loaded_map(INSERT_COUNT);
    let mut rng = ChaCha8Rng::seed_from_u64(0xFEED_FACE);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(0..INSERT_COUNT);
                black_box(base.get(key).expect("get"));
            }
        });
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| {
            let start = rng.gen_range(0..(INSERT_COUNT - RANGE_WIDTH));
            black_box(base.range(start..=start + RANGE_WIDTH).expect("range"));
        });
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("fork_and_write", |b| {
        b.iter(|| {
            let mut fork = base.fork().expect("fork");
            let key = rng.gen_range(0..INSERT_COUNT);
            fork.insert(key, 0).expect("insert");
            fork.release().expect("release");
        });
    });

    group.finish();
}

fn micro_bitmap(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/bitmap");
    group.sample_size(30);

    group.throughput(Throughput::Elements(BITMAP_BITS));
    group.bench_function("append", |b| {
        b.iter_batched(
            || {
                let store: Arc<dyn BlockStore> = Arc::new(MemStore::default());
                AllocationBitmap::create(store, CtrId(2)).expect("bitmap")
            },
            |mut bits| {
                bits.append(BITMAP_BITS, false).expect("append");
                black_box(bits.tree().root());
            },
            BatchSize::SmallInput,
        );
    });

    let store: Arc<dyn BlockStore> = Arc::new(MemStore::default());
    let mut bits = AllocationBitmap::create(store, CtrId(3)).expect("bitmap");
    bits.append(BITMAP_BITS, true).expect("append");
    let mut rng = ChaCha8Rng::seed_from_u64(0xA110C);
    group.throughput(Throughput::Elements(1));
    group.bench_function("free_then_allocate", |b| {
        b.iter(|| {
            let pos = rng.gen_range(0..BITMAP_BITS);
            bits.free(pos).expect("free");
            black_box(bits.allocate().expect("allocate"));
        });
    });

    group.bench_function("rank_select", |b| {
        b.iter(|| {
            let pos = rng.gen_range(0..BITMAP_BITS);
            let rank = bits.rank(pos).expect("rank");
            black_box(bits.select(rank).expect("select"));
        });
    });

    group.finish();
}

criterion_group!(benches, micro_map, micro_bitmap);
criterion_main!(benches);
