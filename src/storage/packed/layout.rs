use crate::primitives::bytes::align::{align_up, is_aligned};
use crate::primitives::bytes::le;
use crate::types::{Result, TreeError};

/// Length of the layout header: segment count, version, data end.
pub const LAYOUT_HDR_LEN: usize = 8;
/// Length of one segment descriptor: offset and used size.
pub const DESCRIPTOR_LEN: usize = 8;
/// Current layout format version.
pub const FORMAT_VERSION: u16 = 1;

mod field {
    pub const COUNT: usize = 0;
    pub const VERSION: usize = 2;
    pub const DATA_END: usize = 4;
}

/// Segment layout over a byte region.
///
/// ```text
/// 0..2    segment count n
/// 2..4    format version
/// 4..8    bytes allocated in the data area
/// 8..     n descriptors {offset: u32, used: u32}
/// 8+8n..  data area
/// ```
///
/// Segment offsets are relative to the data area and always aligned. The
/// allocation of segment `i` runs up to the offset of segment `i + 1` (or to
/// the data end for the last one), so `used` may be smaller than the
/// allocation when a shrink has been deferred. Bytes past `used` inside an
/// allocation, and past the data end, are kept zeroed.
pub struct PackedLayout<B> {
    buf: B,
}

/// Read-only layout borrowed from a block.
pub type LayoutRef<'a> = PackedLayout<&'a [u8]>;
/// Mutable layout borrowed from a block.
pub type LayoutMut<'a> = PackedLayout<&'a mut [u8]>;

impl<B: AsRef<[u8]>> PackedLayout<B> {
    /// Opens an existing layout, validating its descriptors.
    pub fn open(buf: B) -> Result<Self> {
        let layout = Self { buf };
        layout.validate()?;
        Ok(layout)
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Borrows the layout read-only.
    pub fn view(&self) -> LayoutRef<'_> {
        PackedLayout { buf: self.bytes() }
    }

    /// Number of segment slots.
    pub fn segments(&self) -> usize {
        le::get_u16(self.bytes(), field::COUNT) as usize
    }

    /// Layout format version.
    pub fn version(&self) -> u16 {
        le::get_u16(self.bytes(), field::VERSION)
    }

    fn data_start(&self) -> usize {
        LAYOUT_HDR_LEN + self.segments() * DESCRIPTOR_LEN
    }

    fn descriptor(idx: usize) -> usize {
        LAYOUT_HDR_LEN + idx * DESCRIPTOR_LEN
    }

    /// Length of the whole region, header included.
    pub fn region_len(&self) -> usize {
        self.bytes().len()
    }

    /// Bytes available to the data area.
    pub fn capacity(&self) -> usize {
        self.region_len().saturating_sub(self.data_start())
    }

    /// Bytes of the data area currently allocated to segments.
    pub fn allocated(&self) -> usize {
        le::get_u32(self.bytes(), field::DATA_END) as usize
    }

    /// Unallocated bytes at the end of the data area.
    pub fn free_space(&self) -> usize {
        self.capacity().saturating_sub(self.allocated())
    }

    /// Offset of segment `idx` inside the data area.
    pub fn offset(&self, idx: usize) -> usize {
        debug_assert!(idx < self.segments());
        le::get_u32(self.bytes(), Self::descriptor(idx)) as usize
    }

    /// Used bytes of segment `idx`.
    pub fn used(&self, idx: usize) -> usize {
        debug_assert!(idx < self.segments());
        le::get_u32(self.bytes(), Self::descriptor(idx) + 4) as usize
    }

    /// Allocated bytes of segment `idx`.
    pub fn allocation(&self, idx: usize) -> usize {
        let end = if idx + 1 < self.segments() {
            self.offset(idx + 1)
        } else {
            self.allocated()
        };
        end - self.offset(idx)
    }

    /// Used bytes of segment `idx`.
    pub fn segment(&self, idx: usize) -> &[u8] {
        let start = self.data_start() + self.offset(idx);
        &self.bytes()[start..start + self.used(idx)]
    }

    /// Sum of used bytes over all segments.
    pub fn used_bytes(&self) -> usize {
        (0..self.segments()).map(|idx| self.used(idx)).sum()
    }

    /// Data-area bytes the layout would occupy after [`compact`](Self::compact).
    pub fn compacted_bytes(&self) -> usize {
        (0..self.segments())
            .map(|idx| align_up(self.used(idx)))
            .sum()
    }

    /// Region length needed to hold the layout once compacted.
    pub fn required_len(&self) -> usize {
        self.data_start() + self.compacted_bytes()
    }

    /// Extra allocation segment `idx` needs to hold `new_size` bytes.
    pub fn growth_needed(&self, idx: usize, new_size: usize) -> usize {
        align_up(new_size).saturating_sub(self.allocation(idx))
    }

    /// Returns true when segment `idx` can hold `new_size` bytes without
    /// growing the region.
    pub fn can_resize(&self, idx: usize, new_size: usize) -> bool {
        self.growth_needed(idx, new_size) <= self.free_space()
    }

    fn validate(&self) -> Result<()> {
        let bytes = self.bytes();
        if bytes.len() < LAYOUT_HDR_LEN {
            return Err(TreeError::Corruption("layout region shorter than header"));
        }
        if self.version() != FORMAT_VERSION {
            return Err(TreeError::Corruption("unsupported layout version"));
        }
        if self.data_start() > bytes.len() {
            return Err(TreeError::Corruption("segment descriptors overflow region"));
        }
        let data_end = self.allocated();
        if !is_aligned(data_end) || data_end > self.capacity() {
            return Err(TreeError::Corruption("layout data end out of range"));
        }
        let mut prev = 0usize;
        for idx in 0..self.segments() {
            let offset = self.offset(idx);
            if idx == 0 && offset != 0 {
                return Err(TreeError::Corruption("first segment not at data start"));
            }
            if offset < prev || offset > data_end || !is_aligned(offset) {
                return Err(TreeError::Corruption("segment offsets out of order"));
            }
            prev = offset;
        }
        for idx in 0..self.segments() {
            if self.used(idx) > self.allocation(idx) {
                return Err(TreeError::Corruption("segment used exceeds allocation"));
            }
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedLayout<B> {
    /// Writes an empty layout with `segments` slots over `buf`.
    pub fn init(mut buf: B, segments: usize) -> Result<Self> {
        let len = buf.as_ref().len();
        let data_start = LAYOUT_HDR_LEN + segments * DESCRIPTOR_LEN;
        if segments > u16::MAX as usize {
            return Err(TreeError::Invalid("too many segments"));
        }
        if data_start > len {
            return Err(TreeError::OutOfSpace {
                needed: data_start,
                available: len,
            });
        }
        let bytes = buf.as_mut();
        bytes.fill(0);
        le::put_u16(bytes, field::COUNT, segments as u16);
        le::put_u16(bytes, field::VERSION, FORMAT_VERSION);
        le::put_u32(bytes, field::DATA_END, 0);
        Ok(Self { buf })
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Mutable access to the used bytes of segment `idx`.
    pub fn segment_mut(&mut self, idx: usize) -> &mut [u8] {
        let start = self.data_start() + self.offset(idx);
        let used = self.used(idx);
        &mut self.bytes_mut()[start..start + used]
    }

    fn set_offset(&mut self, idx: usize, offset: usize) {
        le::put_u32(self.bytes_mut(), Self::descriptor(idx), offset as u32);
    }

    fn set_allocated(&mut self, data_end: usize) {
        le::put_u32(self.bytes_mut(), field::DATA_END, data_end as u32);
    }

    /// Sets the used size of segment `idx` within its allocation.
    ///
    /// Shrinking zeroes the released tail so the allocation stays clean.
    pub fn set_used(&mut self, idx: usize, used: usize) -> Result<()> {
        if used > self.allocation(idx) {
            return Err(TreeError::Invalid("used size exceeds segment allocation"));
        }
        let old = self.used(idx);
        if used < old {
            let start = self.data_start() + self.offset(idx);
            self.bytes_mut()[start + used..start + old].fill(0);
        }
        le::put_u32(self.bytes_mut(), Self::descriptor(idx) + 4, used as u32);
        Ok(())
    }

    fn grow_allocation(&mut self, idx: usize, delta: usize) -> Result<()> {
        let free = self.free_space();
        if delta > free {
            return Err(TreeError::OutOfSpace {
                needed: delta,
                available: free,
            });
        }
        let data_start = self.data_start();
        let seg_end = data_start + self.offset(idx) + self.allocation(idx);
        let end = data_start + self.allocated();
        let bytes = self.bytes_mut();
        bytes.copy_within(seg_end..end, seg_end + delta);
        bytes[seg_end..seg_end + delta].fill(0);
        for next in idx + 1..self.segments() {
            let offset = self.offset(next);
            self.set_offset(next, offset + delta);
        }
        let data_end = self.allocated() + delta;
        self.set_allocated(data_end);
        Ok(())
    }

    fn shrink_allocation(&mut self, idx: usize, delta: usize) {
        let data_start = self.data_start();
        let seg_end = data_start + self.offset(idx) + self.allocation(idx);
        let end = data_start + self.allocated();
        let bytes = self.bytes_mut();
        bytes.copy_within(seg_end..end, seg_end - delta);
        bytes[end - delta..end].fill(0);
        for next in idx + 1..self.segments() {
            let offset = self.offset(next);
            self.set_offset(next, offset - delta);
        }
        let data_end = self.allocated() - delta;
        self.set_allocated(data_end);
    }

    /// Reserves `size` bytes for a segment that has no allocation yet.
    pub fn allocate_segment(&mut self, idx: usize, size: usize) -> Result<usize> {
        if self.allocation(idx) != 0 || self.used(idx) != 0 {
            return Err(TreeError::Invalid("segment already allocated"));
        }
        self.resize_segment(idx, size)
    }

    /// Resizes segment `idx` to exactly `new_size` used bytes, moving the
    /// segments after it. Returns the new allocation.
    ///
    /// On `OutOfSpace` nothing is modified.
    pub fn resize_segment(&mut self, idx: usize, new_size: usize) -> Result<usize> {
        let old_alloc = self.allocation(idx);
        let new_alloc = align_up(new_size);
        if new_alloc > old_alloc {
            self.grow_allocation(idx, new_alloc - old_alloc)?;
        } else if new_alloc < old_alloc {
            let keep = self.used(idx).min(new_size);
            self.set_used(idx, keep)?;
            self.shrink_allocation(idx, old_alloc - new_alloc);
        }
        self.set_used(idx, new_size)?;
        Ok(new_alloc)
    }

    /// Sets the used size of segment `idx`, growing the allocation when
    /// needed and keeping it when shrinking.
    pub fn set_segment_len(&mut self, idx: usize, new_size: usize) -> Result<()> {
        if align_up(new_size) <= self.allocation(idx) {
            self.set_used(idx, new_size)
        } else {
            self.resize_segment(idx, new_size).map(|_| ())
        }
    }

    /// Replaces the contents of segment `idx`.
    pub fn write_segment(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        self.set_segment_len(idx, data.len())?;
        self.segment_mut(idx).copy_from_slice(data);
        Ok(())
    }

    /// Shrinks the allocation of segment `idx` to its used size.
    pub fn compact_segment(&mut self, idx: usize) {
        let target = align_up(self.used(idx));
        let alloc = self.allocation(idx);
        if alloc > target {
            self.shrink_allocation(idx, alloc - target);
        }
    }

    /// Shrinks every segment allocation to its used size.
    pub fn compact(&mut self) {
        for idx in 0..self.segments() {
            self.compact_segment(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(len: usize, segments: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        PackedLayout::init(&mut buf[..], segments).unwrap();
        buf
    }

    #[test]
    fn init_reports_capacity() {
        let buf = fresh(256, 3);
        let layout = PackedLayout::open(&buf[..]).unwrap();
        assert_eq!(layout.segments(), 3);
        assert_eq!(layout.capacity(), 256 - 8 - 24);
        assert_eq!(layout.allocated(), 0);
        assert_eq!(layout.free_space(), layout.capacity());
    }

    #[test]
    fn resizing_shifts_following_segments() {
        let mut buf = fresh(256, 3);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        layout.allocate_segment(0, 5).unwrap();
        layout.allocate_segment(1, 16).unwrap();
        layout.allocate_segment(2, 8).unwrap();
        layout.segment_mut(1).copy_from_slice(&[7u8; 16]);
        layout.segment_mut(2).copy_from_slice(&[9u8; 8]);

        layout.resize_segment(0, 20).unwrap();
        assert_eq!(layout.offset(1), 24);
        assert_eq!(layout.segment(1), &[7u8; 16]);
        assert_eq!(layout.segment(2), &[9u8; 8]);
        assert_eq!(layout.allocation(0), 24);
        assert_eq!(layout.used(0), 20);

        layout.resize_segment(0, 0).unwrap();
        assert_eq!(layout.offset(1), 0);
        assert_eq!(layout.segment(1), &[7u8; 16]);
        assert_eq!(layout.segment(2), &[9u8; 8]);
        assert_eq!(layout.allocated(), 24);
    }

    #[test]
    fn failed_growth_leaves_layout_untouched() {
        let mut buf = fresh(64, 2);
        let before;
        {
            let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
            layout.allocate_segment(0, 16).unwrap();
            layout.segment_mut(0).copy_from_slice(&[1u8; 16]);
            before = layout.view().bytes().to_vec();
            let err = layout.resize_segment(1, 64).unwrap_err();
            assert!(matches!(
                err,
                TreeError::OutOfSpace {
                    needed: 64,
                    available: 24
                }
            ));
        }
        assert_eq!(buf, before);
    }

    #[test]
    fn deferred_shrink_then_compact() {
        let mut buf = fresh(256, 2);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        layout.allocate_segment(0, 64).unwrap();
        layout.allocate_segment(1, 8).unwrap();
        layout.set_segment_len(0, 10).unwrap();
        assert_eq!(layout.allocation(0), 64);
        assert_eq!(layout.compacted_bytes(), 16 + 8);
        assert!(layout.segment_mut(0).iter().all(|b| *b == 0));
        layout.compact();
        assert_eq!(layout.allocation(0), 16);
        assert_eq!(layout.allocated(), 24);
        assert_eq!(layout.offset(1), 16);
    }

    #[test]
    fn growing_region_adds_capacity_exactly() {
        let mut buf = fresh(128, 2);
        let (cap, alloc) = {
            let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
            layout.allocate_segment(0, 40).unwrap();
            (layout.capacity(), layout.allocated())
        };
        buf.resize(256, 0);
        let layout = PackedLayout::open(&buf[..]).unwrap();
        assert_eq!(layout.capacity(), cap + 128);
        assert_eq!(layout.allocated(), alloc);
    }

    #[test]
    fn open_rejects_bad_version() {
        let mut buf = fresh(64, 1);
        buf[2] = 9;
        assert!(matches!(
            PackedLayout::open(&buf[..]),
            Err(TreeError::Corruption(_))
        ));
    }

    #[test]
    fn allocate_twice_is_invalid() {
        let mut buf = fresh(64, 1);
        let mut layout = PackedLayout::open(&mut buf[..]).unwrap();
        layout.allocate_segment(0, 8).unwrap();
        assert!(matches!(
            layout.allocate_segment(0, 8),
            Err(TreeError::Invalid(_))
        ));
    }
}
