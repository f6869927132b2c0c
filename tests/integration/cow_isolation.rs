#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;

use cowtree::{AllocationBitmap, BlockStore, CowMap, CtrId, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use common::{init_tracing, registry, small_options, store};

fn model_entries(model: &BTreeMap<u64, u64>) -> Vec<(u64, u64)> {
    model.iter().map(|(k, v)| (*k, *v)).collect()
}

#[test]
fn forks_diverge_without_seeing_each_other() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut base = CowMap::create_with(store, registry(), small_options(), CtrId(1))?;
    let mut base_model = BTreeMap::new();
    for key in 0..2000u64 {
        base.insert(key, key)?;
        base_model.insert(key, key);
    }

    let mut handles = vec![(base, base_model)];
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    for round in 0..6 {
        let pick = rng.gen_range(0..handles.len());
        let fork = handles[pick].0.fork()?;
        let model = handles[pick].1.clone();
        handles.push((fork, model));
        for (map, model) in handles.iter_mut() {
            for _ in 0..150 {
                let key = rng.gen_range(0..2500u64);
                if rng.gen_bool(0.5) {
                    let value = key + 1000 * (round + 1);
                    assert_eq!(map.insert(key, value)?, model.insert(key, value));
                } else {
                    assert_eq!(map.remove(key)?, model.remove(&key));
                }
            }
        }
    }

    for (map, model) in &handles {
        assert_eq!(map.entries()?, model_entries(model));
        let report = map.tree().verify()?;
        assert!(report.is_clean(), "{:?}", report.findings);
    }
    for (map, _) in handles {
        map.release()?;
    }
    assert!(mem.live_ids().is_empty());
    assert_eq!(mem.stats().live_bytes, 0);
    Ok(())
}

#[test]
fn releasing_the_source_keeps_the_fork_readable() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(2))?;
    for key in (0..1500u64).rev() {
        map.insert(key, key * 3)?;
    }
    let fork = map.fork()?;
    map.release()?;
    assert_eq!(fork.len()?, 1500);
    assert_eq!(fork.get(777)?, Some(777 * 3));
    assert_eq!(mem.ref_count(fork.tree().root())?, 1);
    assert!(fork.tree().verify()?.is_clean());
    fork.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}

#[test]
fn write_to_a_fork_clones_only_its_path() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(3))?;
    for key in 0..3000u64 {
        map.insert(key, key)?;
    }
    let depth = map.tree().depth()?;
    let live = mem.live_ids().len();
    let mut fork = map.fork()?;
    fork.insert(1234, 0)?;
    assert_eq!(mem.live_ids().len(), live + depth);
    assert_eq!(fork.tree().stats().clones(), depth as u64);
    fork.insert(1234, 1)?;
    assert_eq!(mem.live_ids().len(), live + depth);
    assert_eq!(fork.tree().stats().clones(), depth as u64);
    assert_eq!(map.get(1234)?, Some(1234));
    fork.release()?;
    assert_eq!(mem.live_ids().len(), live);
    map.release()?;
    Ok(())
}

#[test]
fn bitmap_forks_are_isolated() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut bits = AllocationBitmap::create_with(store, registry(), small_options(), CtrId(4))?;
    bits.append(20_000, false)?;
    for pos in (0..20_000).step_by(3) {
        bits.set(pos, true)?;
    }
    let mut fork = bits.fork()?;
    let ones = bits.count_ones()?;
    let first_free = fork.allocate()?;
    assert_eq!(first_free, 1);
    fork.free(0)?;
    fork.append(10, true)?;
    assert_eq!(bits.count_ones()?, ones);
    assert_eq!(bits.len()?, 20_000);
    assert_eq!(bits.get(0)?, Some(true));
    assert_eq!(bits.get(1)?, Some(false));
    assert_eq!(fork.count_ones()?, ones + 10);
    assert_eq!(fork.len()?, 20_010);
    assert!(bits.tree().verify()?.is_clean());
    assert!(fork.tree().verify()?.is_clean());
    fork.release()?;
    bits.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}
