#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;
use std::ops::Bound;

use cowtree::{CowMap, CtrId};
use proptest::prelude::*;

use common::{init_tracing, registry, small_options, store};

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Remove(u64),
    Get(u64),
    Range(u64, u64),
    RemoveRange(u64, u64),
    Batch(Vec<(u64, u64)>),
    Fork,
    DropFork,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u64..2000, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        3 => (0u64..2000).prop_map(Op::Remove),
        2 => (0u64..2000).prop_map(Op::Get),
        1 => (0u64..2000, 0u64..400).prop_map(|(start, len)| Op::Range(start, start + len)),
        1 => (0u64..2000, 0u64..600).prop_map(|(start, len)| Op::RemoveRange(start, start + len)),
        1 => prop::collection::vec((0u64..2400, any::<u64>()), 0..300).prop_map(Op::Batch),
        1 => Just(Op::Fork),
        1 => Just(Op::DropFork),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn map_matches_btreemap(
        seed in prop::collection::vec(0u64..2000, 0..1500),
        ops in prop::collection::vec(op_strategy(), 1..400),
    ) {
        init_tracing();
        let (mem, store) = store();
        let mut map = CowMap::create_with(store, registry(), small_options(), CtrId(1)).unwrap();
        let mut model = BTreeMap::new();
        for key in seed {
            prop_assert_eq!(map.insert(key, !key).unwrap(), model.insert(key, !key));
        }
        let mut frozen: Option<(CowMap, BTreeMap<u64, u64>)> = None;

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    prop_assert_eq!(map.insert(k, v).unwrap(), model.insert(k, v));
                }
                Op::Remove(k) => {
                    prop_assert_eq!(map.remove(k).unwrap(), model.remove(&k));
                }
                Op::Get(k) => {
                    prop_assert_eq!(map.get(k).unwrap(), model.get(&k).copied());
                }
                Op::Range(start, end) => {
                    let expected: Vec<(u64, u64)> = model
                        .range((Bound::Included(start), Bound::Excluded(end)))
                        .map(|(k, v)| (*k, *v))
                        .collect();
                    prop_assert_eq!(map.range(start..end).unwrap(), expected);
                    let expected: Vec<(u64, u64)> =
                        model.range(start..=end).map(|(k, v)| (*k, *v)).collect();
                    prop_assert_eq!(map.range(start..=end).unwrap(), expected);
                }
                Op::RemoveRange(start, end) => {
                    let doomed: Vec<u64> = model.range(start..end).map(|(k, _)| *k).collect();
                    for key in &doomed {
                        model.remove(key);
                    }
                    prop_assert_eq!(map.remove_range(start..end).unwrap(), doomed.len() as u64);
                }
                Op::Batch(entries) => {
                    let mut added = 0u64;
                    for (k, v) in &entries {
                        if model.insert(*k, *v).is_none() {
                            added += 1;
                        }
                    }
                    prop_assert_eq!(map.insert_batch(entries).unwrap(), added);
                }
                Op::Fork => {
                    if let Some((old, _)) = frozen.take() {
                        old.release().unwrap();
                    }
                    frozen = Some((map.fork().unwrap(), model.clone()));
                }
                Op::DropFork => {
                    if let Some((old, snapshot)) = frozen.take() {
                        let entries: Vec<(u64, u64)> =
                            snapshot.iter().map(|(k, v)| (*k, *v)).collect();
                        prop_assert_eq!(old.entries().unwrap(), entries);
                        old.release().unwrap();
                    }
                }
            }
        }

        prop_assert_eq!(map.len().unwrap(), model.len() as u64);
        prop_assert_eq!(map.first().unwrap(), model.iter().next().map(|(k, v)| (*k, *v)));
        prop_assert_eq!(map.last().unwrap(), model.iter().next_back().map(|(k, v)| (*k, *v)));
        let entries: Vec<(u64, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(map.entries().unwrap(), entries);
        let report = map.tree().verify().unwrap();
        prop_assert!(report.is_clean(), "{:?}", report.findings);

        if let Some((old, snapshot)) = frozen.take() {
            prop_assert_eq!(old.len().unwrap(), snapshot.len() as u64);
            prop_assert!(old.tree().verify().unwrap().is_clean());
            old.release().unwrap();
        }
        map.release().unwrap();
        prop_assert!(mem.live_ids().is_empty());
    }
}
