#![allow(missing_docs)]

mod common;

use cowtree::storage::btree::PathRepair;
use cowtree::{AllocationBitmap, CowMap, CtrId, Result, TreeError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use common::{init_tracing, registry, small_options, store};

struct Model {
    bits: Vec<bool>,
}

impl Model {
    fn rank(&self, pos: u64) -> u64 {
        let end = (pos as usize).min(self.bits.len());
        self.bits[..end].iter().filter(|b| **b).count() as u64
    }

    fn select(&self, k: u64) -> Option<u64> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .nth(k as usize)
            .map(|(pos, _)| pos as u64)
    }

    fn allocate(&mut self) -> u64 {
        match self.bits.iter().position(|b| !*b) {
            Some(pos) => {
                self.bits[pos] = true;
                pos as u64
            }
            None => {
                self.bits.push(true);
                self.bits.len() as u64 - 1
            }
        }
    }
}

fn check(bitmap: &AllocationBitmap, model: &Model, rng: &mut ChaCha8Rng) -> Result<()> {
    let len = model.bits.len() as u64;
    assert_eq!(bitmap.len()?, len);
    let ones = model.rank(len);
    assert_eq!(bitmap.count_ones()?, ones);
    for _ in 0..64 {
        let pos = rng.gen_range(0..len + 2);
        assert_eq!(bitmap.get(pos)?, model.bits.get(pos as usize).copied());
        assert_eq!(bitmap.rank(pos)?, model.rank(pos), "rank({pos})");
        let k = rng.gen_range(0..ones + 2);
        assert_eq!(bitmap.select(k)?, model.select(k), "select({k})");
    }
    let report = bitmap.tree().verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.units, len);
    Ok(())
}

#[test]
fn bitmap_matches_vec_model() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut bitmap = AllocationBitmap::create_with(store, registry(), small_options(), CtrId(9))?;
    let mut model = Model { bits: Vec::new() };
    let mut rng = ChaCha8Rng::seed_from_u64(0xB175);
    for step in 0..3000 {
        match rng.gen_range(0..10) {
            0 => {
                let count = rng.gen_range(1..2000u64);
                let value = rng.gen_bool(0.3);
                bitmap.append(count, value)?;
                model.bits.extend(std::iter::repeat(value).take(count as usize));
            }
            1..=4 if !model.bits.is_empty() => {
                let pos = rng.gen_range(0..model.bits.len());
                let value = rng.gen_bool(0.5);
                assert_eq!(bitmap.set(pos as u64, value)?, model.bits[pos]);
                model.bits[pos] = value;
            }
            5..=7 => {
                assert_eq!(bitmap.allocate()?, model.allocate());
            }
            _ if !model.bits.is_empty() => {
                let pos = rng.gen_range(0..model.bits.len());
                assert_eq!(bitmap.free(pos as u64)?, model.bits[pos]);
                model.bits[pos] = false;
            }
            _ => {}
        }
        if step % 250 == 0 {
            check(&bitmap, &model, &mut rng)?;
        }
    }
    check(&bitmap, &model, &mut rng)?;
    assert!(bitmap.tree().depth()? > 1);
    bitmap.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}

#[test]
fn long_append_spreads_over_full_leaves() -> Result<()> {
    init_tracing();
    let (_mem, store) = store();
    let mut bitmap = AllocationBitmap::create_with(store, registry(), small_options(), CtrId(10))?;
    bitmap.append(100_000, true)?;
    bitmap.append(1, false)?;
    assert_eq!(bitmap.len()?, 100_001);
    assert_eq!(bitmap.count_ones()?, 100_000);
    assert_eq!(bitmap.select(99_999)?, Some(99_999));
    assert_eq!(bitmap.rank(50_000)?, 50_000);
    assert_eq!(bitmap.allocate()?, 100_000);
    assert_eq!(bitmap.allocate()?, 100_001);

    let report = bitmap.tree().verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    let mut path = bitmap.tree().root_path()?;
    let mut full = 0;
    let mut leaves = 1;
    loop {
        let desc = bitmap.tree().describe_block(path.id(0)?)?;
        if desc.block_size == 1024 {
            full += 1;
        }
        if !bitmap.tree().next_node(&mut path, 0)? {
            break;
        }
        leaves += 1;
    }
    assert!(leaves > 10);
    assert!(full >= leaves - 1);
    Ok(())
}

#[test]
fn out_of_range_positions() -> Result<()> {
    init_tracing();
    let (_mem, store) = store();
    let mut bitmap = AllocationBitmap::create_with(store, registry(), small_options(), CtrId(11))?;
    assert!(bitmap.is_empty()?);
    assert_eq!(bitmap.get(0)?, None);
    assert_eq!(bitmap.rank(10)?, 0);
    assert_eq!(bitmap.select(0)?, None);
    assert!(matches!(bitmap.set(0, true), Err(TreeError::Invalid(_))));
    assert_eq!(bitmap.allocate()?, 0);
    assert_eq!(bitmap.get(0)?, Some(true));
    assert!(bitmap.free(0)?);
    assert!(!bitmap.free(0)?);
    assert_eq!(bitmap.allocate()?, 0);
    Ok(())
}

#[test]
fn bitmap_root_cannot_open_as_map() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let bitmap =
        AllocationBitmap::create_with(store.clone(), registry(), small_options(), CtrId(12))?;
    let root = bitmap.tree().root();
    assert!(matches!(
        CowMap::open(store.clone(), registry(), small_options(), root),
        Err(TreeError::Invalid(_))
    ));
    let reopened = AllocationBitmap::open(store, registry(), small_options(), root)?;
    assert!(reopened.is_empty()?);
    reopened.release()?;
    bitmap.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}
