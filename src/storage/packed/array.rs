use crate::primitives::bytes::le;
use crate::types::{Result, TreeError};

use super::layout::PackedLayout;

const WIDTH: usize = 8;

/// Read view over a segment of little-endian u64 values.
#[derive(Clone, Copy)]
pub struct U64Array<'a> {
    bytes: &'a [u8],
}

impl<'a> U64Array<'a> {
    /// Wraps the used bytes of a segment.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Bytes needed to store `n` values.
    pub const fn bytes_for(n: usize) -> usize {
        n * WIDTH
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.bytes.len() / WIDTH
    }

    /// Returns true when the array holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `idx`, if in range.
    pub fn get(&self, idx: usize) -> Option<u64> {
        (idx < self.len()).then(|| le::get_u64(self.bytes, idx * WIDTH))
    }

    /// Last value.
    pub fn last(&self) -> Option<u64> {
        self.len().checked_sub(1).and_then(|idx| self.get(idx))
    }

    /// Iterates over every value in order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + 'a {
        self.bytes
            .chunks_exact(WIDTH)
            .map(|chunk| le::get_u64(chunk, 0))
    }

    /// Sum of the values in `start..end`.
    pub fn sum_range(&self, start: usize, end: usize) -> u64 {
        (start..end.min(self.len()))
            .map(|idx| le::get_u64(self.bytes, idx * WIDTH))
            .fold(0u64, u64::wrapping_add)
    }

    /// Binary search over values sorted ascending.
    pub fn binary_search(&self, value: u64) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let candidate = le::get_u64(self.bytes, mid * WIDTH);
            match candidate.cmp(&value) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Copies the values in `start..end` out.
    pub fn to_vec_range(&self, start: usize, end: usize) -> Vec<u64> {
        (start..end.min(self.len()))
            .map(|idx| le::get_u64(self.bytes, idx * WIDTH))
            .collect()
    }
}

/// Mutable access to a u64 array segment of a layout.
pub struct U64ArrayMut<'l, B> {
    layout: &'l mut PackedLayout<B>,
    seg: usize,
}

impl<'l, B: AsRef<[u8]> + AsMut<[u8]>> U64ArrayMut<'l, B> {
    /// Binds segment `seg` of `layout`.
    pub fn new(layout: &'l mut PackedLayout<B>, seg: usize) -> Self {
        Self { layout, seg }
    }

    /// Read view of the current values.
    pub fn view(&self) -> U64Array<'_> {
        U64Array::new(self.layout.segment(self.seg))
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.layout.used(self.seg) / WIDTH
    }

    /// Returns true when the array holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extra allocation needed to add `additional` values.
    pub fn growth_for(&self, additional: usize) -> usize {
        self.layout
            .growth_needed(self.seg, U64Array::bytes_for(self.len() + additional))
    }

    /// Overwrites the value at `idx`.
    pub fn set(&mut self, idx: usize, value: u64) -> Result<()> {
        if idx >= self.len() {
            return Err(TreeError::Invalid("array index out of range"));
        }
        le::put_u64(self.layout.segment_mut(self.seg), idx * WIDTH, value);
        Ok(())
    }

    /// Inserts `values` before `idx`.
    pub fn insert_slice(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        let len = self.len();
        if idx > len {
            return Err(TreeError::Invalid("array index out of range"));
        }
        if values.is_empty() {
            return Ok(());
        }
        self.layout
            .set_segment_len(self.seg, U64Array::bytes_for(len + values.len()))?;
        let bytes = self.layout.segment_mut(self.seg);
        bytes.copy_within(idx * WIDTH..len * WIDTH, (idx + values.len()) * WIDTH);
        for (offset, value) in values.iter().enumerate() {
            le::put_u64(bytes, (idx + offset) * WIDTH, *value);
        }
        Ok(())
    }

    /// Inserts one value before `idx`.
    pub fn insert(&mut self, idx: usize, value: u64) -> Result<()> {
        self.insert_slice(idx, &[value])
    }

    /// Appends `values` at the end.
    pub fn extend(&mut self, values: &[u64]) -> Result<()> {
        let len = self.len();
        self.insert_slice(len, values)
    }

    /// Removes `start..end`.
    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<()> {
        let len = self.len();
        if start > end || end > len {
            return Err(TreeError::Invalid("array range out of bounds"));
        }
        if start == end {
            return Ok(());
        }
        let bytes = self.layout.segment_mut(self.seg);
        bytes.copy_within(end * WIDTH..len * WIDTH, start * WIDTH);
        let new_len = len - (end - start);
        self.layout
            .set_segment_len(self.seg, U64Array::bytes_for(new_len))
    }

    /// Removes and returns the value at `idx`.
    pub fn remove(&mut self, idx: usize) -> Result<u64> {
        let value = self
            .view()
            .get(idx)
            .ok_or(TreeError::Invalid("array index out of range"))?;
        self.remove_range(idx, idx + 1)?;
        Ok(value)
    }

    /// Drops every value from `len` on.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        let current = self.len();
        if len < current {
            self.remove_range(len, current)?;
        }
        Ok(())
    }
}
