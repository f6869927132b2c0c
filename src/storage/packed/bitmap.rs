use std::ops::Range;

use crate::primitives::bytes::le;
use crate::types::{Result, TreeError};

use super::layout::PackedLayout;

const LEN_FIELD: usize = 8;

fn words_for(bits: usize) -> usize {
    bits.div_ceil(64)
}

fn low_mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Read view over a bitmap segment: a u64 bit count followed by words.
///
/// Bits at or past the count are always zero.
#[derive(Clone, Copy)]
pub struct Bitmap<'a> {
    bytes: &'a [u8],
}

impl<'a> Bitmap<'a> {
    /// Bytes needed to store `bits` bits.
    pub fn bytes_for(bits: usize) -> usize {
        LEN_FIELD + words_for(bits) * 8
    }

    /// Wraps the used bytes of a bitmap segment.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < LEN_FIELD {
            return Err(TreeError::Corruption("bitmap shorter than length field"));
        }
        let bitmap = Self { bytes };
        if bytes.len() != Self::bytes_for(bitmap.len()) {
            return Err(TreeError::Corruption("bitmap length mismatch"));
        }
        Ok(bitmap)
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        le::get_u64(self.bytes, 0) as usize
    }

    /// Returns true when the bitmap holds no bits.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of words.
    pub fn words(&self) -> usize {
        words_for(self.len())
    }

    /// Word `idx`.
    pub fn word(&self, idx: usize) -> u64 {
        le::get_u64(self.bytes, LEN_FIELD + idx * 8)
    }

    /// Bit at `pos`, if in range.
    pub fn get(&self, pos: usize) -> Option<bool> {
        (pos < self.len()).then(|| (self.word(pos / 64) >> (pos % 64)) & 1 == 1)
    }

    /// Number of set bits in `range`.
    pub fn count_ones(&self, range: Range<usize>) -> u64 {
        let end = range.end.min(self.len());
        let mut pos = range.start;
        let mut total = 0u64;
        while pos < end {
            let word = pos / 64;
            let shift = pos % 64;
            let take = (64 - shift).min(end - pos);
            total += ((self.word(word) >> shift) & low_mask(take)).count_ones() as u64;
            pos += take;
        }
        total
    }

    /// Position of the `k`-th set bit (0-based) inside word `idx`.
    pub fn select_in_word(&self, idx: usize, k: u32) -> Option<usize> {
        let mut word = self.word(idx);
        for _ in 0..k {
            if word == 0 {
                return None;
            }
            word &= word - 1;
        }
        (word != 0).then(|| idx * 64 + word.trailing_zeros() as usize)
    }

    /// First clear bit at or after `from`.
    pub fn first_zero(&self, from: usize) -> Option<usize> {
        let len = self.len();
        let mut pos = from;
        while pos < len {
            let word = pos / 64;
            let shift = pos % 64;
            let inverted = !self.word(word) >> shift;
            if inverted != 0 {
                let found = pos + inverted.trailing_zeros() as usize;
                return (found < len).then_some(found);
            }
            pos = (word + 1) * 64;
        }
        None
    }

    /// Copies `range` out as words starting at bit 0.
    pub fn extract(&self, range: Range<usize>) -> Vec<u64> {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        let bits = end - start;
        let mut out = Vec::with_capacity(words_for(bits));
        let words = self.words();
        let mut pos = start;
        while pos < end {
            let word = pos / 64;
            let shift = pos % 64;
            let mut value = self.word(word) >> shift;
            if shift != 0 && word + 1 < words {
                value |= self.word(word + 1) << (64 - shift);
            }
            let take = 64.min(end - pos);
            out.push(value & low_mask(take));
            pos += take;
        }
        out
    }
}

/// Mutable access to a bitmap segment of a layout.
pub struct BitmapMut<'l, B> {
    layout: &'l mut PackedLayout<B>,
    seg: usize,
}

impl<'l, B: AsRef<[u8]> + AsMut<[u8]>> BitmapMut<'l, B> {
    /// Binds segment `seg` of `layout`.
    pub fn new(layout: &'l mut PackedLayout<B>, seg: usize) -> Self {
        Self { layout, seg }
    }

    /// Writes an empty bitmap into the segment.
    pub fn init(&mut self) -> Result<()> {
        self.layout.write_segment(self.seg, &0u64.to_le_bytes())
    }

    /// Read view of the current bits.
    pub fn view(&self) -> Result<Bitmap<'_>> {
        Bitmap::new(self.layout.segment(self.seg))
    }

    /// Number of bits.
    pub fn len(&self) -> Result<usize> {
        Ok(self.view()?.len())
    }

    /// Extra allocation needed to hold `bits` bits in total.
    pub fn growth_for(&self, bits: usize) -> usize {
        self.layout.growth_needed(self.seg, Bitmap::bytes_for(bits))
    }

    fn word_mut(&mut self, idx: usize, f: impl FnOnce(u64) -> u64) {
        let bytes = self.layout.segment_mut(self.seg);
        let off = LEN_FIELD + idx * 8;
        let value = f(le::get_u64(bytes, off));
        le::put_u64(bytes, off, value);
    }

    /// Sets bit `pos` and returns its previous value.
    pub fn set(&mut self, pos: usize, value: bool) -> Result<bool> {
        let old = self
            .view()?
            .get(pos)
            .ok_or(TreeError::Invalid("bit position out of range"))?;
        let mask = 1u64 << (pos % 64);
        self.word_mut(pos / 64, |w| if value { w | mask } else { w & !mask });
        Ok(old)
    }

    /// Changes the bit count, zeroing any bits dropped or added.
    pub fn resize(&mut self, bits: usize) -> Result<()> {
        let old = self.len()?;
        if bits < old {
            self.layout.set_segment_len(self.seg, Bitmap::bytes_for(bits))?;
            let tail = bits % 64;
            if tail != 0 {
                self.word_mut(bits / 64, |w| w & low_mask(tail));
            }
        } else {
            self.layout.set_segment_len(self.seg, Bitmap::bytes_for(bits))?;
        }
        le::put_u64(self.layout.segment_mut(self.seg), 0, bits as u64);
        Ok(())
    }

    /// Appends `count` copies of `value`.
    pub fn append(&mut self, count: usize, value: bool) -> Result<()> {
        let start = self.len()?;
        self.resize(start + count)?;
        if value {
            let mut pos = start;
            let end = start + count;
            while pos < end {
                let shift = pos % 64;
                let take = (64 - shift).min(end - pos);
                let mask = low_mask(take) << shift;
                self.word_mut(pos / 64, |w| w | mask);
                pos += take;
            }
        }
        Ok(())
    }

    /// Appends `bits` bits taken from `words`, starting at bit 0 of the first
    /// word.
    pub fn append_words(&mut self, words: &[u64], bits: usize) -> Result<()> {
        if words.len() < words_for(bits) {
            return Err(TreeError::Invalid("not enough words for bit count"));
        }
        let start = self.len()?;
        self.resize(start + bits)?;
        let shift = start % 64;
        let base = start / 64;
        let total_words = words_for(start + bits);
        let mut remaining = bits;
        for (k, word) in words.iter().take(words_for(bits)).enumerate() {
            let take = remaining.min(64);
            let value = word & low_mask(take);
            self.word_mut(base + k, |w| w | (value << shift));
            if shift != 0 && base + k + 1 < total_words {
                self.word_mut(base + k + 1, |w| w | (value >> (64 - shift)));
            }
            remaining -= take;
        }
        Ok(())
    }

    /// Appends every bit of `src`.
    pub fn append_from(&mut self, src: &Bitmap<'_>) -> Result<()> {
        let words = src.extract(0..src.len());
        self.append_words(&words, src.len())
    }

    /// Moves bits `at..` to the end of `dst`.
    pub fn split_to<C: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        dst: &mut BitmapMut<'_, C>,
        at: usize,
    ) -> Result<()> {
        let (words, bits) = {
            let view = self.view()?;
            if at > view.len() {
                return Err(TreeError::Invalid("split point past bitmap end"));
            }
            (view.extract(at..view.len()), view.len() - at)
        };
        dst.append_words(&words, bits)?;
        self.resize(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_bitmap<R>(segments: usize, f: impl FnOnce(&mut PackedLayout<&mut [u8]>) -> R) -> R {
        let mut buf = vec![0u8; 1024];
        let mut layout = PackedLayout::init(&mut buf[..], segments).unwrap();
        for seg in 0..segments {
            BitmapMut::new(&mut layout, seg).init().unwrap();
        }
        f(&mut layout)
    }

    #[test]
    fn append_set_and_count() {
        with_bitmap(1, |layout| {
            let mut bits = BitmapMut::new(layout, 0);
            bits.append(70, false).unwrap();
            bits.append(10, true).unwrap();
            assert!(!bits.set(3, true).unwrap());
            assert!(bits.set(75, false).unwrap());
            let view = bits.view().unwrap();
            assert_eq!(view.len(), 80);
            assert_eq!(view.count_ones(0..80), 10);
            assert_eq!(view.count_ones(70..80), 9);
            assert_eq!(view.first_zero(0), Some(0));
            assert_eq!(view.first_zero(70), Some(75));
            assert_eq!(view.select_in_word(1, 0), Some(70));
        });
    }

    #[test]
    fn split_then_append_restores_bits() {
        with_bitmap(2, |layout| {
            let pattern: Vec<bool> = (0..200).map(|i| i % 3 == 0 || i % 7 == 0).collect();
            {
                let mut bits = BitmapMut::new(layout, 0);
                for (i, value) in pattern.iter().enumerate() {
                    bits.append(1, *value).unwrap();
                    assert_eq!(bits.view().unwrap().get(i), Some(*value));
                }
            }
            let mut buf = vec![0u8; 1024];
            let mut other = PackedLayout::init(&mut buf[..], 1).unwrap();
            let mut right = BitmapMut::new(&mut other, 0);
            right.init().unwrap();
            {
                let mut left = BitmapMut::new(layout, 0);
                left.split_to(&mut right, 77).unwrap();
                assert_eq!(left.len().unwrap(), 77);
            }
            assert_eq!(right.len().unwrap(), 123);
            for i in 0..123 {
                assert_eq!(right.view().unwrap().get(i), Some(pattern[77 + i]));
            }
            let right_view = Bitmap::new(other.segment(0)).unwrap();
            let mut left = BitmapMut::new(layout, 0);
            left.append_from(&right_view).unwrap();
            let joined = left.view().unwrap();
            for (i, value) in pattern.iter().enumerate() {
                assert_eq!(joined.get(i), Some(*value));
            }
        });
    }

    #[test]
    fn shrinking_clears_dropped_bits() {
        with_bitmap(1, |layout| {
            let mut bits = BitmapMut::new(layout, 0);
            bits.append(64, true).unwrap();
            bits.resize(10).unwrap();
            bits.resize(64).unwrap();
            assert_eq!(bits.view().unwrap().count_ones(0..64), 10);
        });
    }
}
