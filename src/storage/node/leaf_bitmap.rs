//! Bitmap leaves: a bit array plus a rank index over word popcounts.

use crate::storage::packed::{Bitmap, BitmapMut, LayoutMut, LayoutRef, PackedLayout, SumIndex};
use crate::types::{Result, TreeError};

use super::common::{NodeLayout, Summary, FIRST_STREAM};
use super::registry::NodeKind;

/// Bit array segment.
pub const BITS: usize = FIRST_STREAM;
/// [`SumIndex`] over per-word popcounts.
pub const RANK: usize = FIRST_STREAM + 1;

const STREAMS: [&str; 2] = ["bits", "rank_index"];

/// Bitmap leaf layout.
pub struct BitmapLeaf;

fn words_for(bits: usize) -> usize {
    bits.div_ceil(64)
}

/// Bit array of the leaf.
pub fn bits<'a>(layout: &'a LayoutRef<'_>) -> Result<Bitmap<'a>> {
    Bitmap::new(layout.segment(BITS))
}

fn rank_index<'a>(layout: &'a LayoutRef<'_>) -> Result<SumIndex<'a>> {
    SumIndex::new(layout.segment(RANK))
}

/// Number of bits.
pub fn len(layout: &LayoutRef<'_>) -> Result<usize> {
    Ok(bits(layout)?.len())
}

/// Bit at `pos`.
pub fn get(layout: &LayoutRef<'_>, pos: usize) -> Result<Option<bool>> {
    Ok(bits(layout)?.get(pos))
}

/// Number of set bits.
pub fn count_ones(layout: &LayoutRef<'_>) -> Result<u64> {
    Ok(rank_index(layout)?.total())
}

/// Set bits in `0..pos`.
pub fn rank(layout: &LayoutRef<'_>, pos: usize) -> Result<u64> {
    let bits = bits(layout)?;
    let pos = pos.min(bits.len());
    let words = pos / 64;
    let full = rank_index(layout)?.prefix_sum(words, |w| bits.word(w).count_ones() as u64);
    Ok(full + bits.count_ones(words * 64..pos))
}

/// Position of the set bit with rank `k` (0-based).
pub fn select(layout: &LayoutRef<'_>, k: u64) -> Result<Option<usize>> {
    let bits = bits(layout)?;
    let found = rank_index(layout)?.find(k, |w| bits.word(w).count_ones() as u64);
    Ok(found.and_then(|(word, before)| bits.select_in_word(word, (k - before) as u32)))
}

/// First clear bit at or after `from`.
pub fn first_zero(layout: &LayoutRef<'_>, from: usize) -> Result<Option<usize>> {
    Ok(bits(layout)?.first_zero(from))
}

fn growth_for_len(layout: &LayoutRef<'_>, bits: usize) -> usize {
    layout.growth_needed(BITS, Bitmap::bytes_for(bits))
        + layout.growth_needed(RANK, SumIndex::encoded_len(words_for(bits)))
}

/// Extra allocation needed to append `count` bits.
pub fn append_growth(layout: &LayoutRef<'_>, count: usize) -> Result<usize> {
    Ok(growth_for_len(layout, len(layout)? + count))
}

/// Rebuilds the rank index from the bit array.
pub fn reindex<B: AsRef<[u8]> + AsMut<[u8]>>(layout: &mut PackedLayout<B>) -> Result<()> {
    let bytes = {
        let view = layout.view();
        let bits = bits(&view)?;
        SumIndex::build(bits.words(), |w| bits.word(w).count_ones() as u64)
    };
    layout.write_segment(RANK, &bytes)
}

/// Appends `count` copies of `value`.
pub fn append<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    count: usize,
    value: bool,
) -> Result<()> {
    {
        let view = layout.view();
        let growth = append_growth(&view, count)?;
        if growth > view.free_space() {
            return Err(TreeError::OutOfSpace {
                needed: growth,
                available: view.free_space(),
            });
        }
    }
    BitmapMut::new(layout, BITS).append(count, value)?;
    reindex(layout)
}

/// Sets bit `pos` and returns its previous value.
pub fn set<B: AsRef<[u8]> + AsMut<[u8]>>(
    layout: &mut PackedLayout<B>,
    pos: usize,
    value: bool,
) -> Result<bool> {
    let old = BitmapMut::new(layout, BITS).set(pos, value)?;
    if old != value {
        reindex(layout)?;
    }
    Ok(old)
}

/// Stream bytes of a leaf holding `bits` bits.
pub fn stream_bytes(bits: usize) -> usize {
    Bitmap::bytes_for(bits) + SumIndex::encoded_len(words_for(bits))
}

impl NodeLayout for BitmapLeaf {
    const KIND: NodeKind = NodeKind::BitmapLeaf;
    const STREAMS: &'static [&'static str] = &STREAMS;

    fn init(layout: &mut LayoutMut<'_>) -> Result<()> {
        BitmapMut::new(layout, BITS).init()?;
        reindex(layout)
    }

    fn size(layout: &LayoutRef<'_>) -> Result<usize> {
        len(layout)
    }

    fn summary(layout: &LayoutRef<'_>) -> Result<Summary> {
        Ok(Summary::new(count_ones(layout)?, len(layout)? as u64))
    }

    fn summary_range(layout: &LayoutRef<'_>, start: usize, end: usize) -> Result<Summary> {
        let bits = bits(layout)?;
        let end = end.min(bits.len());
        let start = start.min(end);
        Ok(Summary::new(
            bits.count_ones(start..end),
            (end - start) as u64,
        ))
    }

    fn split_to(src: &mut LayoutMut<'_>, dst: &mut LayoutMut<'_>, at: usize) -> Result<()> {
        {
            let mut right = BitmapMut::new(dst, BITS);
            BitmapMut::new(src, BITS).split_to(&mut right, at)?;
        }
        reindex(dst)?;
        reindex(src)
    }

    fn merge_growth(dst: &LayoutRef<'_>, src: &LayoutRef<'_>) -> Result<usize> {
        Ok(growth_for_len(dst, len(dst)? + len(src)?))
    }

    fn merge_from(dst: &mut LayoutMut<'_>, src: &LayoutRef<'_>) -> Result<()> {
        let src_bits = bits(src)?;
        BitmapMut::new(dst, BITS).append_from(&src_bits)?;
        reindex(dst)
    }

    fn remove_units(layout: &mut LayoutMut<'_>, start: usize, end: usize) -> Result<()> {
        let (tail, tail_bits) = {
            let view = layout.view();
            let bits = bits(&view)?;
            if start > end || end > bits.len() {
                return Err(TreeError::Invalid("bit range out of bounds"));
            }
            (bits.extract(end..bits.len()), bits.len() - end)
        };
        {
            let mut bitmap = BitmapMut::new(layout, BITS);
            bitmap.resize(start)?;
            bitmap.append_words(&tail, tail_bits)?;
        }
        reindex(layout)
    }

    fn check(layout: &LayoutRef<'_>) -> Result<()> {
        let bits = bits(layout)?;
        let tail = bits.len() % 64;
        if tail != 0 && bits.word(bits.words() - 1) >> tail != 0 {
            return Err(TreeError::Corruption("bitmap has bits past its length"));
        }
        let rebuilt = SumIndex::build(bits.words(), |w| bits.word(w).count_ones() as u64);
        if layout.segment(RANK) != rebuilt.as_slice() {
            return Err(TreeError::Corruption("bitmap rank index is stale"));
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

    fn leaf_buf(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut layout = PackedLayout::init(&mut buf[..], FIRST_STREAM + STREAMS.len()).unwrap();
        BitmapLeaf::init(&mut layout).unwrap();
        buf
    }

    #[test]
    fn rank_and_select_match_reference() {
        let mut buf = leaf_buf(2048);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        let pattern: Vec<bool> = (0..3000).map(|i| i % 5 == 0 || i % 11 == 3).collect();
        for value in &pattern {
            append(&mut layout, 1, *value).unwrap();
        }
        let view = layout.view();
        BitmapLeaf::check(&view).unwrap();
        let mut ones = 0u64;
        for (pos, value) in pattern.iter().enumerate() {
            assert_eq!(rank(&view, pos).unwrap(), ones);
            if *value {
                assert_eq!(select(&view, ones).unwrap(), Some(pos));
                ones += 1;
            }
        }
        assert_eq!(count_ones(&view).unwrap(), ones);
        assert_eq!(select(&view, ones).unwrap(), None);
        assert_eq!(first_zero(&view, 0).unwrap(), Some(1));
    }

    #[test]
    fn set_updates_rank_index() {
        let mut buf = leaf_buf(512);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        append(&mut layout, 130, false).unwrap();
        assert!(!set(&mut layout, 129, true).unwrap());
        assert!(!set(&mut layout, 3, true).unwrap());
        assert!(set(&mut layout, 3, true).unwrap());
        let view = layout.view();
        assert_eq!(BitmapLeaf::summary(&view).unwrap(), Summary::new(2, 130));
        assert_eq!(rank(&view, 129).unwrap(), 1);
        assert_eq!(rank(&view, 130).unwrap(), 2);
        assert_eq!(select(&view, 1).unwrap(), Some(129));
        assert!(set(&mut layout, 130, true).is_err());
    }

    #[test]
    fn split_and_merge_keep_bits() {
        let mut left_buf = leaf_buf(512);
        let mut right_buf = leaf_buf(512);
        let mut left = PackedLayout::open(&mut left_buf[..]).unwrap();
        let mut right = PackedLayout::open(&mut right_buf[..]).unwrap();
        append(&mut left, 100, true).unwrap();
        append(&mut left, 100, false).unwrap();
        BitmapLeaf::split_to(&mut left, &mut right, 150).unwrap();
        assert_eq!(BitmapLeaf::summary(&left.view()).unwrap(), Summary::new(100, 150));
        assert_eq!(BitmapLeaf::summary(&right.view()).unwrap(), Summary::new(0, 50));
        BitmapLeaf::check(&right.view()).unwrap();

        let growth = BitmapLeaf::merge_growth(&left.view(), &right.view()).unwrap();
        assert!(growth <= left.free_space());
        let right_view = right.view();
        BitmapLeaf::merge_from(&mut left, &right_view).unwrap();
        assert_eq!(BitmapLeaf::summary(&left.view()).unwrap(), Summary::new(100, 200));
        BitmapLeaf::check(&left.view()).unwrap();
    }

    #[test]
    fn append_past_capacity_is_out_of_space() {
        let mut buf = leaf_buf(128);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        let err = append(&mut layout, 64 * 20, true).unwrap_err();
        assert!(matches!(err, TreeError::OutOfSpace { .. }));
        assert_eq!(len(&layout.view()).unwrap(), 0);
    }

    #[test]
    fn remove_units_shifts_the_tail_down() {
        let mut buf = leaf_buf(1024);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        let pattern: Vec<bool> = (0..300)
            .map(|i| i % 7 == 2 || (100..140).contains(&i))
            .collect();
        for value in &pattern {
            append(&mut layout, 1, *value).unwrap();
        }
        BitmapLeaf::remove_units(&mut layout, 37, 171).unwrap();
        let kept: Vec<bool> = pattern[..37].iter().chain(&pattern[171..]).copied().collect();
        let view = layout.view();
        assert_eq!(len(&view).unwrap(), kept.len());
        for (pos, value) in kept.iter().enumerate() {
            assert_eq!(get(&view, pos).unwrap(), Some(*value), "bit {pos}");
        }
        assert_eq!(
            count_ones(&view).unwrap(),
            kept.iter().filter(|bit| **bit).count() as u64
        );
        BitmapLeaf::check(&view).unwrap();
        assert!(BitmapLeaf::remove_units(&mut layout, 10, 500).is_err());
    }

    #[test]
    fn reindex_is_idempotent() {
        let mut buf = leaf_buf(1024);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        for i in 0..700 {
            append(&mut layout, 1, i % 3 == 0 || i % 64 == 63).unwrap();
        }
        let built = layout.view().segment(RANK).to_vec();
        reindex(&mut layout).unwrap();
        let once = layout.view().segment(RANK).to_vec();
        reindex(&mut layout).unwrap();
        let twice = layout.view().segment(RANK).to_vec();
        assert_eq!(built, once);
        assert_eq!(once, twice);
        let ones = (0..700).filter(|i| i % 3 == 0 || i % 64 == 63).count() as u64;
        assert_eq!(count_ones(&layout.view()).unwrap(), ones);
        BitmapLeaf::check(&layout.view()).unwrap();
    }
}
