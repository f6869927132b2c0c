use smallvec::SmallVec;

use crate::primitives::bytes::le;
use crate::types::{Result, TreeError};

/// Values summed by one index entry.
pub const FANOUT: usize = 32;

const HEADER_LEN: usize = 8;

/// Hierarchical prefix-sum index over an external value sequence.
///
/// Level 0 holds the sums of consecutive runs of [`FANOUT`] values, each
/// higher level sums runs of the level below, and the top level has a single
/// entry. The encoding is `{n: u32, levels: u32}` followed by the levels,
/// lowest first. The values themselves live elsewhere (a sizes array, a
/// bitmap's word popcounts) and are passed in as a closure.
#[derive(Clone, Copy)]
pub struct SumIndex<'a> {
    bytes: &'a [u8],
}

fn level_counts(n: usize) -> SmallVec<[usize; 8]> {
    let mut counts = SmallVec::new();
    if n == 0 {
        return counts;
    }
    let mut count = n;
    loop {
        count = count.div_ceil(FANOUT);
        counts.push(count);
        if count == 1 {
            break;
        }
    }
    counts
}

impl<'a> SumIndex<'a> {
    /// Encoded size of an index over `n` values.
    pub fn encoded_len(n: usize) -> usize {
        HEADER_LEN + level_counts(n).iter().sum::<usize>() * 8
    }

    /// Builds the encoded index for `n` values in one pass per level.
    pub fn build(n: usize, value: impl Fn(usize) -> u64) -> Vec<u8> {
        let counts = level_counts(n);
        let mut out = Vec::with_capacity(Self::encoded_len(n));
        out.extend_from_slice(&(n as u32).to_le_bytes());
        out.extend_from_slice(&(counts.len() as u32).to_le_bytes());
        let mut below: Vec<u64> = Vec::new();
        for (level, count) in counts.iter().enumerate() {
            let mut sums = Vec::with_capacity(*count);
            for entry in 0..*count {
                let start = entry * FANOUT;
                let sum = if level == 0 {
                    (start..(start + FANOUT).min(n))
                        .map(&value)
                        .fold(0u64, u64::wrapping_add)
                } else {
                    below[start..(start + FANOUT).min(below.len())]
                        .iter()
                        .fold(0u64, |acc, v| acc.wrapping_add(*v))
                };
                sums.push(sum);
            }
            for sum in &sums {
                out.extend_from_slice(&sum.to_le_bytes());
            }
            below = sums;
        }
        out
    }

    /// Wraps encoded index bytes.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(TreeError::Corruption("sum index shorter than header"));
        }
        let index = Self { bytes };
        let counts = level_counts(index.len());
        if counts.len() != index.levels() || bytes.len() != Self::encoded_len(index.len()) {
            return Err(TreeError::Corruption("sum index size mismatch"));
        }
        Ok(index)
    }

    /// Number of indexed values.
    pub fn len(&self) -> usize {
        le::get_u32(self.bytes, 0) as usize
    }

    /// Returns true when no values are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn levels(&self) -> usize {
        le::get_u32(self.bytes, 4) as usize
    }

    fn level(&self, level: usize) -> (usize, usize) {
        let counts = level_counts(self.len());
        let start = HEADER_LEN + counts[..level].iter().sum::<usize>() * 8;
        (start, counts[level])
    }

    fn entry(&self, level_start: usize, idx: usize) -> u64 {
        le::get_u64(self.bytes, level_start + idx * 8)
    }

    /// Sum of all indexed values.
    pub fn total(&self) -> u64 {
        match self.levels() {
            0 => 0,
            levels => {
                let (start, _) = self.level(levels - 1);
                self.entry(start, 0)
            }
        }
    }

    /// Sum of the first `count` values.
    pub fn prefix_sum(&self, count: usize, value: impl Fn(usize) -> u64) -> u64 {
        let count = count.min(self.len());
        let mut total = 0u64;
        let block = count / FANOUT;
        for idx in block * FANOUT..count {
            total = total.wrapping_add(value(idx));
        }
        let mut remaining = block;
        let levels = self.levels();
        for level in 0..levels {
            if remaining == 0 {
                break;
            }
            let (start, _) = self.level(level);
            if level + 1 == levels {
                for idx in 0..remaining {
                    total = total.wrapping_add(self.entry(start, idx));
                }
                break;
            }
            let block = remaining / FANOUT;
            for idx in block * FANOUT..remaining {
                total = total.wrapping_add(self.entry(start, idx));
            }
            remaining = block;
        }
        total
    }

    /// Locates the value covering `target`: returns `(i, prefix_sum(i))` for
    /// the first `i` with `prefix_sum(i + 1) > target`, or `None` when
    /// `target >= total()`.
    pub fn find(&self, target: u64, value: impl Fn(usize) -> u64) -> Option<(usize, u64)> {
        if target >= self.total() {
            return None;
        }
        let mut acc = 0u64;
        let mut base = 0usize;
        for level in (0..self.levels()).rev() {
            let (start, count) = self.level(level);
            let first = base * FANOUT;
            let mut found = None;
            for idx in first..(first + FANOUT).min(count) {
                let sum = self.entry(start, idx);
                if acc + sum > target {
                    found = Some(idx);
                    break;
                }
                acc += sum;
            }
            base = found?;
        }
        let first = base * FANOUT;
        for idx in first..(first + FANOUT).min(self.len()) {
            let v = value(idx);
            if acc + v > target {
                return Some((idx, acc));
            }
            acc += v;
        }
        None
    }
}
