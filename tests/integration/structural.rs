#![allow(missing_docs)]

mod common;

use std::ops::Bound;
use std::sync::Arc;

use cowtree::storage::btree::{NodeSizing, PathRepair, StructuralMutation};
use cowtree::{
    BlockStore, CowMap, CtrId, MemStore, MemStoreOptions, Result, StoreError, TreeError,
    TreeOptions,
};

use common::{init_tracing, registry, small_options, store};

#[test]
fn depth_follows_content_up_and_down() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(1))?;
    let mut depths = Vec::new();
    for key in 0..4000u64 {
        map.insert(key.wrapping_mul(0x9E37_79B9) % 100_003, key)?;
        let depth = map.tree().depth()?;
        if depths.last() != Some(&depth) {
            depths.push(depth);
        }
    }
    assert_eq!(depths, vec![1, 2, 3]);
    let report = map.tree().verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.units, 4000);

    let keys: Vec<u64> = map.entries()?.into_iter().map(|(k, _)| k).collect();
    for key in keys {
        map.remove(key)?;
    }
    assert!(map.is_empty()?);
    assert_eq!(map.tree().depth()?, 1);
    assert_eq!(mem.live_ids(), vec![map.tree().root()]);
    let stats = map.tree().stats().snapshot();
    assert_eq!(stats.root_promotions, stats.root_demotions);
    assert!(stats.merges > 0);
    map.release()?;
    Ok(())
}

#[test]
fn manual_split_then_rebalance_restores_shape() -> Result<()> {
    init_tracing();
    let (_mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(2))?;
    for key in 0..20u64 {
        map.insert(key, key)?;
    }
    let tree = map.tree_mut();
    let mut path = tree.root_path()?;
    tree.split_node(&mut path, 0, 3)?;
    assert_eq!(tree.depth()?, 2);
    tree.check_path(&path)?;
    tree.rebalance(&mut path, 0)?;
    assert_eq!(tree.depth()?, 1);
    assert_eq!(tree.stats().merges(), 1);
    assert_eq!(
        map.entries()?,
        (0..20).map(|k| (k, k)).collect::<Vec<_>>()
    );
    assert!(map.tree().verify()?.is_clean());
    Ok(())
}

#[test]
fn large_blocks_shrink_after_bulk_removal() -> Result<()> {
    init_tracing();
    let (_mem, store) = store();
    let options = TreeOptions {
        default_block_size: 1024,
        min_block_size: 512,
        max_block_size: 4096,
        merge_threshold_pct: 25,
    };
    let mut map = CowMap::create_with(store, registry(), options, CtrId(3))?;
    for key in 0..200u64 {
        map.insert(key, key)?;
    }
    let before = map.tree().describe_block(map.tree().root())?;
    assert_eq!(before.block_size, 4096);
    for key in 10..200u64 {
        map.remove(key)?;
    }
    let after = map.tree().describe_block(map.tree().root())?;
    assert!(after.block_size < before.block_size);
    assert!(after.block_size >= 512);
    assert!(map.tree().stats().downsizes() > 0);

    let mut path = map.tree().root_path()?;
    assert!(!map.tree_mut().downsize(&mut path, 0)?);
    assert!(map.tree().verify()?.is_clean());
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    init_tracing();
    let options = TreeOptions::from_toml_str(
        r#"
        default_block_size = 512
        min_block_size = 512
        max_block_size = 2048
        merge_threshold_pct = 40
        "#,
    )?;
    let (_mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), options.clone(), CtrId(4))?;
    for key in 0..500u64 {
        map.insert(key, key)?;
    }
    assert_eq!(map.tree().options(), &options);
    let root = map.tree().describe_block(map.tree().root())?;
    assert!(root.block_size <= 2048);
    assert!(matches!(
        TreeOptions::from_toml_str("min_block_size = 16384"),
        Err(TreeError::Config(_))
    ));
    Ok(())
}

#[test]
fn exhausted_store_surfaces_as_store_error() -> Result<()> {
    init_tracing();
    let mem = Arc::new(MemStore::new(MemStoreOptions {
        capacity_bytes: Some(16 * 1024),
    }));
    let store: Arc<dyn BlockStore> = mem.clone();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(5))?;
    let mut failure = None;
    for key in 0..10_000u64 {
        if let Err(err) = map.insert(key, key) {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(
        failure,
        Some(TreeError::Store(StoreError::Exhausted { .. }))
    ));
    assert!(mem.stats().live_bytes <= 16 * 1024);
    Ok(())
}

#[test]
fn range_removal_frees_dropped_subtrees() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(1))?;
    for key in 0..5000u64 {
        map.insert(key * 2, key)?;
    }
    let depth = map.tree().depth()?;
    let live = mem.live_ids().len();

    assert_eq!(map.remove_range(200..9800)?, 4800);
    assert_eq!(map.remove_range(300..100)?, 0);
    assert_eq!(map.len()?, 200);
    assert_eq!(map.range(..)?.len(), 200);
    assert_eq!(map.first()?, Some((0, 0)));
    assert_eq!(map.get(198)?, Some(99));
    assert_eq!(map.get(200)?, None);
    assert_eq!(map.get(9800)?, Some(4900));
    assert!(map.tree().depth()? <= depth);
    let report = map.tree().verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(mem.live_ids().len() as u64, report.nodes);
    assert!(report.nodes * 5 < live as u64);

    assert_eq!(map.remove_range((Bound::Excluded(0), Bound::Unbounded))?, 199);
    assert_eq!(map.entries()?, vec![(0, 0)]);
    assert_eq!(map.remove_range(..)?, 1);
    assert!(map.is_empty()?);
    assert_eq!(mem.live_ids(), vec![map.tree().root()]);
    map.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}

#[test]
fn batch_insert_spills_into_linked_leaves() -> Result<()> {
    init_tracing();
    let (mem, store) = store();
    let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(1))?;
    assert_eq!(map.insert_batch((0..3000u64).map(|k| (k, k + 1)))?, 3000);
    assert!(map.tree().depth()? > 1);
    let report = map.tree().verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.units, 3000);

    let fork = map.fork()?;
    let overlap: Vec<(u64, u64)> = (2500..3500u64).rev().map(|k| (k, 7)).collect();
    assert_eq!(map.insert_batch(overlap)?, 500);
    assert_eq!(map.insert_batch([(10, 1), (10, 2)])?, 0);
    assert_eq!(map.get(10)?, Some(2));
    assert_eq!(map.get(2499)?, Some(2500));
    assert_eq!(map.get(2500)?, Some(7));
    assert_eq!(map.get(3499)?, Some(7));
    assert_eq!(map.len()?, 3500);
    assert_eq!(fork.len()?, 3000);
    assert_eq!(fork.get(2500)?, Some(2501));
    assert!(map.tree().verify()?.is_clean());
    assert!(fork.tree().verify()?.is_clean());

    fork.release()?;
    map.release()?;
    assert!(mem.live_ids().is_empty());
    Ok(())
}
