//! Branch nodes: child ids with a per-child key aggregate and unit count,
//! plus a prefix-sum index over the counts for positional descent.

use std::marker::PhantomData;

use crate::storage::packed::{LayoutMut, LayoutRef, PackedLayout, SumIndex, U64Array, U64ArrayMut};
use crate::types::{BlockId, Result, TreeError};

use super::common::{NodeLayout, Summary, FIRST_STREAM};
use super::registry::NodeKind;

/// Child block ids.
pub const CHILDREN: usize = FIRST_STREAM;
/// Per-child key aggregate.
pub const KEYS: usize = FIRST_STREAM + 1;
/// Per-child unit count.
pub const SIZES: usize = FIRST_STREAM + 2;
/// [`SumIndex`] over [`SIZES`].
pub const SIZE_INDEX: usize = FIRST_STREAM + 3;

const STREAMS: [&str; 4] = ["children", "keys", "sizes", "size_index"];

/// How child keys combine into the branch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAgg {
    /// Largest child key (ordered maps).
    Max,
    /// Sum of child keys (counts such as set bits).
    Sum,
}

impl KeyAgg {
    /// Combines two keys.
    pub fn combine(self, a: u64, b: u64) -> u64 {
        match self {
            KeyAgg::Max => a.max(b),
            KeyAgg::Sum => a.wrapping_add(b),
        }
    }
}

/// Selects the key aggregation of a branch variant.
pub trait AggPolicy {
    /// Aggregation used for keys.
    const AGG: KeyAgg;
    /// Variant the policy belongs to.
    const KIND: NodeKind;
}

/// Keys aggregate by maximum.
pub struct MaxKeys;
/// Keys aggregate by sum.
pub struct SumKeys;

impl AggPolicy for MaxKeys {
    const AGG: KeyAgg = KeyAgg::Max;
    const KIND: NodeKind = NodeKind::MapBranch;
}

impl AggPolicy for SumKeys {
    const AGG: KeyAgg = KeyAgg::Sum;
    const KIND: NodeKind = NodeKind::BitmapBranch;
}

/// Branch layout parameterised by key aggregation.
pub struct Branch<A>(PhantomData<A>);

/// Branch of an ordered map.
pub type MapBranch = Branch<MaxKeys>;
/// Branch of a bitmap.
pub type BitmapBranch = Branch<SumKeys>;

fn children<'a>(layout: &'a LayoutRef<'_>) -> U64Array<'a> {
    U64Array::new(layout.segment(CHILDREN))
}

fn keys<'a>(layout: &'a LayoutRef<'_>) -> U64Array<'a> {
    U64Array::new(layout.segment(KEYS))
}

fn sizes<'a>(layout: &'a LayoutRef<'_>) -> U64Array<'a> {
    U64Array::new(layout.segment(SIZES))
}

/// Number of children.
pub fn len(layout: &LayoutRef<'_>) -> usize {
    children(layout).len()
}

/// Child id at `idx`.
pub fn child(layout: &LayoutRef<'_>, idx: usize) -> Result<BlockId> {
    children(layout)
        .get(idx)
        .map(BlockId)
        .ok_or_else(|| TreeError::invariant(format!("branch child index {idx} out of range")))
}

/// Every child id in order.
pub fn child_ids(layout: &LayoutRef<'_>) -> Vec<BlockId> {
    children(layout).iter().map(BlockId).collect()
}

/// Index of child `id`, if present.
pub fn position_of(layout: &LayoutRef<'_>, id: BlockId) -> Option<usize> {
    children(layout).iter().position(|child| child == id.0)
}

/// Stored summary of the child at `idx`.
pub fn entry(layout: &LayoutRef<'_>, idx: usize) -> Result<Summary> {
    match (keys(layout).get(idx), sizes(layout).get(idx)) {
        (Some(key), Some(size)) => Ok(Summary::new(key, size)),
        _ => Err(TreeError::invariant(format!(
            "branch entry index {idx} out of range"
        ))),
    }
}

/// Prefix-sum index over child sizes.
pub fn size_index<'a>(layout: &'a LayoutRef<'_>) -> Result<SumIndex<'a>> {
    SumIndex::new(layout.segment(SIZE_INDEX))
}

/// Aggregate over children `start..end`.
pub fn summary_range(layout: &LayoutRef<'_>, agg: KeyAgg, start: usize, end: usize) -> Summary {
    let keys = keys(layout);
    let key = (start..end.min(keys.len()))
        .filter_map(|idx| keys.get(idx))
        .fold(0u64, |acc, k| agg.combine(acc, k));
    Summary::new(key, sizes(layout).sum_range(start, end))
}

/// Aggregate over every child.
pub fn summary(layout: &LayoutRef<'_>, agg: KeyAgg) -> Result<Summary> {
    let key = keys(layout).iter().fold(0u64, |acc, k| agg.combine(acc, k));
    Ok(Summary::new(key, size_index(layout)?.total()))
}

/// First child whose key is at least `key`, else the last child.
pub fn find_key(layout: &LayoutRef<'_>, key: u64) -> Result<usize> {
    let keys = keys(layout);
    if keys.is_empty() {
        return Err(TreeError::invariant("descending into an empty branch"));
    }
    Ok(keys
        .iter()
        .position(|k| k >= key)
        .unwrap_or(keys.len() - 1))
}

/// Child covering unit `pos` and the units before it, or `None` when `pos`
/// is at or past the end.
pub fn find_position(layout: &LayoutRef<'_>, pos: u64) -> Result<Option<(usize, u64)>> {
    let sizes = sizes(layout);
    let index = size_index(layout)?;
    Ok(index.find(pos, |idx| sizes.get(idx).unwrap_or(0)))
}

/// Units held by children before `idx`.
pub fn prefix_size(layout: &LayoutRef<'_>, idx: usize) -> Result<u64> {
    let sizes = sizes(layout);
    let index = size_index(layout)?;
    Ok(index.prefix_sum(idx, |i| sizes.get(i).unwrap_or(0)))
}

/// Sum of child keys before `idx`.
pub fn prefix_keys(layout: &LayoutRef<'_>, idx: usize) -> u64 {
    keys(layout).sum_range(0, idx)
}

/// Extra allocation needed to add `count` children.
pub fn insert_growth(layout: &LayoutRef<'_>, count: usize) -> usize {
    let n = len(layout) + count;
    let array = U64Array::bytes_for(n);
    layout.growth_needed(CHILDREN, array)
        + layout.growth_needed(KEYS, array)
        + layout.growth_needed(SIZES, array)
        + layout.growth_needed(SIZE_INDEX, SumIndex::encoded_len(n))
}

/// Rebuilds the size index from the sizes stream.
pub fn reindex<B: AsRef<[u8]> + AsMut<[u8]>>(layout: &mut PackedLayout<B>) -> Result<()> {
    let bytes = {
        let view = layout.view();
        let sizes = sizes(&view);
        SumIndex::build(sizes.len(), |idx| sizes.get(idx).unwrap_or(0))
    };
    layout.write_segment(SIZE_INDEX, &bytes)
}

/// Inserts children before `idx`.
pub fn insert_children<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    entries: &[(BlockId, Summary)],
) -> Result<()> {
    if idx > len(&layout.view()) {
        return Err(TreeError::invariant(format!(
            "branch insert index {idx} out of range"
        )));
    }
    if entries.iter().any(|(id, _)| id.is_null()) {
        return Err(TreeError::Invalid("null child id"));
    }
    let view = layout.view();
    let growth = insert_growth(&view, entries.len());
    if growth > view.free_space() {
        return Err(TreeError::OutOfSpace {
            needed: growth,
            available: view.free_space(),
        });
    }
    let ids: Vec<u64> = entries.iter().map(|(id, _)| id.0).collect();
    let ks: Vec<u64> = entries.iter().map(|(_, s)| s.key).collect();
    let ss: Vec<u64> = entries.iter().map(|(_, s)| s.size).collect();
    U64ArrayMut::new(layout, CHILDREN).insert_slice(idx, &ids)?;
    U64ArrayMut::new(layout, KEYS).insert_slice(idx, &ks)?;
    U64ArrayMut::new(layout, SIZES).insert_slice(idx, &ss)?;
    reindex(layout)
}

/// Inserts one child before `idx`.
pub fn insert_child<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    child: BlockId,
    summary: Summary,
) -> Result<()> {
    insert_children(layout, idx, &[(child, summary)])
}

/// Removes children `start..end`.
pub fn remove_children<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    start: usize,
    end: usize,
) -> Result<()> {
    U64ArrayMut::new(layout, CHILDREN).remove_range(start, end)?;
    U64ArrayMut::new(layout, KEYS).remove_range(start, end)?;
    U64ArrayMut::new(layout, SIZES).remove_range(start, end)?;
    reindex(layout)
}

/// Replaces the child id at `idx`.
pub fn set_child<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    id: BlockId,
) -> Result<()> {
    if id.is_null() {
        return Err(TreeError::Invalid("null child id"));
    }
    U64ArrayMut::new(layout, CHILDREN).set(idx, id.0)
}

/// Replaces the stored summary of the child at `idx`.
pub fn set_entry<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    idx: usize,
    summary: Summary,
) -> Result<()> {
    U64ArrayMut::new(layout, KEYS).set(idx, summary.key)?;
    let old = sizes(&layout.view()).get(idx);
    U64ArrayMut::new(layout, SIZES).set(idx, summary.size)?;
    if old != Some(summary.size) {
        reindex(layout)?;
    }
    Ok(())
}

/// Stream bytes of a branch with `n` children.
pub fn stream_bytes(n: usize) -> usize {
    3 * U64Array::bytes_for(n) + SumIndex::encoded_len(n)
}

impl<A: AggPolicy> NodeLayout for Branch<A> {
    const KIND: NodeKind = A::KIND;
    const STREAMS: &'static [&'static str] = &STREAMS;

    fn init(layout: &mut LayoutMut<'_>) -> Result<()> {
        reindex(layout)
    }

    fn size(layout: &LayoutRef<'_>) -> Result<usize> {
        Ok(len(layout))
    }

    fn summary(layout: &LayoutRef<'_>) -> Result<Summary> {
        summary(layout, A::AGG)
    }

    fn summary_range(layout: &LayoutRef<'_>, start: usize, end: usize) -> Result<Summary> {
        Ok(summary_range(layout, A::AGG, start, end))
    }

    fn split_to(src: &mut LayoutMut<'_>, dst: &mut LayoutMut<'_>, at: usize) -> Result<()> {
        let view = src.view();
        let n = len(&view);
        if at > n {
            return Err(TreeError::Invalid("split point past branch end"));
        }
        let ids = children(&view).to_vec_range(at, n);
        let ks = keys(&view).to_vec_range(at, n);
        let ss = sizes(&view).to_vec_range(at, n);
        U64ArrayMut::new(dst, CHILDREN).extend(&ids)?;
        U64ArrayMut::new(dst, KEYS).extend(&ks)?;
        U64ArrayMut::new(dst, SIZES).extend(&ss)?;
        reindex(dst)?;
        U64ArrayMut::new(src, CHILDREN).truncate(at)?;
        U64ArrayMut::new(src, KEYS).truncate(at)?;
        U64ArrayMut::new(src, SIZES).truncate(at)?;
        reindex(src)
    }

    fn merge_growth(dst: &LayoutRef<'_>, src: &LayoutRef<'_>) -> Result<usize> {
        Ok(insert_growth(dst, len(src)))
    }

    fn merge_from(dst: &mut LayoutMut<'_>, src: &LayoutRef<'_>) -> Result<()> {
        U64ArrayMut::new(dst, CHILDREN).extend(&children(src).to_vec_range(0, len(src)))?;
        U64ArrayMut::new(dst, KEYS).extend(&keys(src).to_vec_range(0, len(src)))?;
        U64ArrayMut::new(dst, SIZES).extend(&sizes(src).to_vec_range(0, len(src)))?;
        reindex(dst)
    }

    fn remove_units(layout: &mut LayoutMut<'_>, start: usize, end: usize) -> Result<()> {
        remove_children(layout, start, end)
    }

    fn for_each_child(layout: &LayoutRef<'_>, f: &mut dyn FnMut(BlockId)) -> Result<()> {
        for id in children(layout).iter() {
            f(BlockId(id));
        }
        Ok(())
    }

    fn check(layout: &LayoutRef<'_>) -> Result<()> {
        let n = len(layout);
        if keys(layout).len() != n || sizes(layout).len() != n {
            return Err(TreeError::Corruption("branch streams differ in length"));
        }
        if layout.used(CHILDREN) % 8 != 0 {
            return Err(TreeError::Corruption("branch children stream misaligned"));
        }
        if children(layout).iter().any(|id| id == 0) {
            return Err(TreeError::Corruption("branch holds a null child"));
        }
        let index = size_index(layout)?;
        let sizes = sizes(layout);
        let rebuilt = SumIndex::build(n, |idx| sizes.get(idx).unwrap_or(0));
        if index.len() != n || layout.segment(SIZE_INDEX) != rebuilt.as_slice() {
            return Err(TreeError::Corruption("branch size index is stale"));
        }
        if A::AGG == KeyAgg::Max {
            let keys = keys(layout);
            if keys.iter().zip(keys.iter().skip(1)).any(|(a, b)| a >= b) {
                return Err(TreeError::invariant("map branch keys not strictly ascending"));
            }
        }
        Ok(())
    }

    fn stream_bytes(units: usize) -> usize {
        stream_bytes(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::common::FIRST_STREAM;

    fn branch_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let mut layout = PackedLayout::init(&mut buf[..], FIRST_STREAM + STREAMS.len()).unwrap();
        MapBranch::init(&mut layout).unwrap();
        buf
    }

    fn fill(layout: &mut LayoutMut<'_>, n: u64) {
        let entries: Vec<(BlockId, Summary)> = (1..=n)
            .map(|i| (BlockId(100 + i), Summary::new(i * 10, i)))
            .collect();
        insert_children(layout, 0, &entries).unwrap();
    }

    #[test]
    fn summaries_follow_aggregation() {
        let mut buf = branch_buf();
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        fill(&mut layout, 5);
        let view = layout.view();
        assert_eq!(summary(&view, KeyAgg::Max).unwrap(), Summary::new(50, 15));
        assert_eq!(summary(&view, KeyAgg::Sum).unwrap(), Summary::new(150, 15));
        assert_eq!(summary_range(&view, KeyAgg::Sum, 1, 3), Summary::new(50, 5));
        assert_eq!(find_key(&view, 25).unwrap(), 2);
        assert_eq!(find_key(&view, 999).unwrap(), 4);
        assert_eq!(find_position(&view, 0).unwrap(), Some((0, 0)));
        assert_eq!(find_position(&view, 3).unwrap(), Some((2, 3)));
        assert_eq!(find_position(&view, 15).unwrap(), None);
        assert_eq!(prefix_size(&view, 3).unwrap(), 6);
        assert_eq!(position_of(&view, BlockId(103)), Some(2));
        MapBranch::check(&view).unwrap();
    }

    #[test]
    fn split_and_merge_preserve_children() {
        let mut left_buf = branch_buf();
        let mut right_buf = branch_buf();
        let mut left = PackedLayout::open(&mut left_buf[..]).unwrap();
        let mut right = PackedLayout::open(&mut right_buf[..]).unwrap();
        fill(&mut left, 6);
        let before = MapBranch::summary(&left.view()).unwrap();
        MapBranch::split_to(&mut left, &mut right, 4).unwrap();
        let l = MapBranch::summary(&left.view()).unwrap();
        let r = MapBranch::summary(&right.view()).unwrap();
        assert_eq!(l.size + r.size, before.size);
        assert_eq!(child_ids(&right.view()), vec![BlockId(105), BlockId(106)]);
        MapBranch::check(&left.view()).unwrap();
        MapBranch::check(&right.view()).unwrap();

        let growth = MapBranch::merge_growth(&left.view(), &right.view()).unwrap();
        assert!(growth <= left.free_space());
        let right_view = right.view();
        MapBranch::merge_from(&mut left, &right_view).unwrap();
        assert_eq!(MapBranch::summary(&left.view()).unwrap(), before);
        assert_eq!(len(&left.view()), 6);
    }

    #[test]
    fn set_entry_reindexes_sizes() {
        let mut buf = branch_buf();
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        fill(&mut layout, 3);
        set_entry(&mut layout, 1, Summary::new(25, 40)).unwrap();
        let view = layout.view();
        assert_eq!(summary(&view, KeyAgg::Max).unwrap(), Summary::new(30, 44));
        assert_eq!(find_position(&view, 40).unwrap(), Some((1, 1)));
        assert_eq!(find_position(&view, 41).unwrap(), Some((2, 41)));
        BitmapBranch::check(&view).unwrap();
    }

    #[test]
    fn remove_children_keeps_index_fresh() {
        let mut buf = branch_buf();
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        fill(&mut layout, 30);
        remove_children(&mut layout, 10, 25).unwrap();
        let view = layout.view();
        assert_eq!(len(&view), 15);
        MapBranch::check(&view).unwrap();
        assert_eq!(
            summary(&view, KeyAgg::Sum).unwrap().size,
            (1..=10).sum::<u64>() + (26..=30).sum::<u64>()
        );
    }

    #[test]
    fn reindex_is_idempotent() {
        let mut buf = branch_buf();
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        fill(&mut layout, 17);
        let built = layout.view().segment(SIZE_INDEX).to_vec();
        reindex(&mut layout).unwrap();
        let once = layout.view().segment(SIZE_INDEX).to_vec();
        reindex(&mut layout).unwrap();
        let twice = layout.view().segment(SIZE_INDEX).to_vec();
        assert_eq!(built, once);
        assert_eq!(once, twice);
        assert_eq!(size_index(&layout.view()).unwrap().total(), (1..=17).sum::<u64>());
        MapBranch::check(&layout.view()).unwrap();
    }
}
