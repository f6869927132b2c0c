//! Leaves of an ordered u64 map: parallel key and value arrays, keys strictly
//! ascending.

use crate::storage::packed::{LayoutMut, LayoutRef, PackedLayout, U64Array, U64ArrayMut};
use crate::types::{Result, TreeError};

use super::common::{NodeLayout, Summary, FIRST_STREAM};
use super::registry::NodeKind;

/// Sorted keys.
pub const KEYS: usize = FIRST_STREAM;
/// Values, parallel to [`KEYS`].
pub const VALUES: usize = FIRST_STREAM + 1;

const STREAMS: [&str; 2] = ["keys", "values"];

/// Map leaf layout.
pub struct MapLeaf;

fn keys<'a>(layout: &'a LayoutRef<'_>) -> U64Array<'a> {
    U64Array::new(layout.segment(KEYS))
}

fn values<'a>(layout: &'a LayoutRef<'_>) -> U64Array<'a> {
    U64Array::new(layout.segment(VALUES))
}

/// Number of entries.
pub fn len(layout: &LayoutRef<'_>) -> usize {
    keys(layout).len()
}

/// Binary search for `key`: `Ok(idx)` when present, `Err(insert_at)` otherwise.
pub fn find(layout: &LayoutRef<'_>, key: u64) -> std::result::Result<usize, usize> {
    keys(layout).binary_search(key)
}

/// Entry at `idx`.
pub fn entry(layout: &LayoutRef<'_>, idx: usize) -> Option<(u64, u64)> {
    Some((keys(layout).get(idx)?, values(layout).get(idx)?))
}

/// Every entry in key order.
pub fn entries(layout: &LayoutRef<'_>) -> Vec<(u64, u64)> {
    keys(layout).iter().zip(values(layout).iter()).collect()
}

/// Smallest entry.
pub fn first(layout: &LayoutRef<'_>) -> Option<(u64, u64)> {
    entry(layout, 0)
}

/// Largest entry.
pub fn last(layout: &LayoutRef<'_>) -> Option<(u64, u64)> {
    len(layout).checked_sub(1).and_then(|idx| entry(layout, idx))
}

/// Extra allocation needed to add one entry.
pub fn insert_growth(layout: &LayoutRef<'_>) -> usize {
    let bytes = U64Array::bytes_for(len(layout) + 1);
    layout.growth_needed(KEYS, bytes) + layout.growth_needed(VALUES, bytes)
}

/// Inserts a new entry at `idx`, which must keep the keys strictly ascending.
pub fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    key: u64,
    value: u64,
) -> Result<()> {
    {
        let view = layout.view();
        let keys = keys(&view);
        if idx > keys.len() {
            return Err(TreeError::invariant(format!(
                "map leaf insert index {idx} out of range"
            )));
        }
        let after_prev = idx == 0 || keys.get(idx - 1).is_some_and(|k| k < key);
        let before_next = keys.get(idx).map_or(true, |k| key < k);
        if !after_prev || !before_next {
            return Err(TreeError::invariant("map leaf insert breaks key order"));
        }
        let growth = insert_growth(&view);
        if growth > view.free_space() {
            return Err(TreeError::OutOfSpace {
                needed: growth,
                available: view.free_space(),
            });
        }
    }
    U64ArrayMut::new(layout, KEYS).insert(idx, key)?;
    U64ArrayMut::new(layout, VALUES).insert(idx, value)
}

/// Overwrites the value at `idx` and returns the old one.
pub fn set_value<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    value: u64,
) -> Result<u64> {
    let old = values(&layout.view())
        .get(idx)
        .ok_or_else(|| TreeError::invariant(format!("map leaf index {idx} out of range")))?;
    U64ArrayMut::new(layout, VALUES).set(idx, value)?;
    Ok(old)
}

/// Removes the entry at `idx` and returns it.
pub fn remove<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
) -> Result<(u64, u64)> {
    let key = U64ArrayMut::new(layout, KEYS).remove(idx)?;
    let value = U64ArrayMut::new(layout, VALUES).remove(idx)?;
    Ok((key, value))
}

/// Extra allocation needed to hold exactly `n` entries.
pub fn assign_growth(layout: &LayoutRef<'_>, n: usize) -> usize {
    let bytes = U64Array::bytes_for(n);
    layout.growth_needed(KEYS, bytes) + layout.growth_needed(VALUES, bytes)
}

/// Replaces every entry with `entries`, whose keys must be strictly
/// ascending.
pub fn assign<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    entries: &[(u64, u64)],
) -> Result<()> {
    if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
        return Err(TreeError::invariant("map leaf assign breaks key order"));
    }
    {
        let view = layout.view();
        let growth = assign_growth(&view, entries.len());
        if growth > view.free_space() {
            return Err(TreeError::OutOfSpace {
                needed: growth,
                available: view.free_space(),
            });
        }
    }
    let ks: Vec<u64> = entries.iter().map(|(key, _)| *key).collect();
    let vs: Vec<u64> = entries.iter().map(|(_, value)| *value).collect();
    let mut keys = U64ArrayMut::new(layout, KEYS);
    keys.truncate(0)?;
    keys.extend(&ks)?;
    let mut values = U64ArrayMut::new(layout, VALUES);
    values.truncate(0)?;
    values.extend(&vs)
}

/// Stream bytes of a leaf with `n` entries.
pub fn stream_bytes(n: usize) -> usize {
    2 * U64Array::bytes_for(n)
}

impl NodeLayout for MapLeaf {
    const KIND: NodeKind = NodeKind::MapLeaf;
    const STREAMS: &'static [&'static str] = &STREAMS;

    fn init(_layout: &mut LayoutMut<'_>) -> Result<()> {
        Ok(())
    }

    fn size(layout: &LayoutRef<'_>) -> Result<usize> {
        Ok(len(layout))
    }

    fn summary(layout: &LayoutRef<'_>) -> Result<Summary> {
        let n = len(layout);
        Ok(Summary::new(keys(layout).last().unwrap_or(0), n as u64))
    }

    fn summary_range(layout: &LayoutRef<'_>, start: usize, end: usize) -> Result<Summary> {
        let end = end.min(len(layout));
        if start >= end {
            return Ok(Summary::default());
        }
        let key = keys(layout).get(end - 1).unwrap_or(0);
        Ok(Summary::new(key, (end - start) as u64))
    }

    fn split_to(src: &mut LayoutMut<'_>, dst: &mut LayoutMut<'_>, at: usize) -> Result<()> {
        let view = src.view();
        let n = len(&view);
        if at > n {
            return Err(TreeError::Invalid("split point past leaf end"));
        }
        let ks = keys(&view).to_vec_range(at, n);
        let vs = values(&view).to_vec_range(at, n);
        U64ArrayMut::new(dst, KEYS).extend(&ks)?;
        U64ArrayMut::new(dst, VALUES).extend(&vs)?;
        U64ArrayMut::new(src, KEYS).truncate(at)?;
        U64ArrayMut::new(src, VALUES).truncate(at)
    }

    fn merge_growth(dst: &LayoutRef<'_>, src: &LayoutRef<'_>) -> Result<usize> {
        let bytes = U64Array::bytes_for(len(dst) + len(src));
        Ok(dst.growth_needed(KEYS, bytes) + dst.growth_needed(VALUES, bytes))
    }

    fn merge_from(dst: &mut LayoutMut<'_>, src: &LayoutRef<'_>) -> Result<()> {
        let (dst_last, src_first) = (keys(&dst.view()).last(), keys(src).get(0));
        if let (Some(a), Some(b)) = (dst_last, src_first) {
            if a >= b {
                return Err(TreeError::invariant("merging map leaves out of key order"));
            }
        }
        let n = len(src);
        U64ArrayMut::new(dst, KEYS).extend(&keys(src).to_vec_range(0, n))?;
        U64ArrayMut::new(dst, VALUES).extend(&values(src).to_vec_range(0, n))
    }

    fn remove_units(layout: &mut LayoutMut<'_>, start: usize, end: usize) -> Result<()> {
        U64ArrayMut::new(layout, KEYS).remove_range(start, end)?;
        U64ArrayMut::new(layout, VALUES).remove_range(start, end)
    }

    fn check(layout: &LayoutRef<'_>) -> Result<()> {
        let keys = keys(layout);
        if layout.used(KEYS) % 8 != 0 || layout.used(VALUES) != layout.used(KEYS) {
            return Err(TreeError::Corruption("map leaf streams differ in length"));
        }
        if keys.iter().zip(keys.iter().skip(1)).any(|(a, b)| a >= b) {
            return Err(TreeError::invariant("map leaf keys not strictly ascending"));
        }
        Ok(())
    }

    fn stream_bytes(units: usize) -> usize {
        stream_bytes(units)
    }
}
