#![forbid(unsafe_code)]
//! Fixed-width field access, alignment math and varints shared by the
//! packed layout and node formats.

pub mod le {
    //! Little-endian field accessors over byte slices.
    //!
    //! Callers validate offsets against the layout before calling; an out of
    //! range offset is a bug and panics like slice indexing does.

    use core::convert::TryInto;

    /// Reads a u16 at `off`.
    #[inline]
    pub fn get_u16(src: &[u8], off: usize) -> u16 {
        let bytes: [u8; 2] = src[off..off + 2].try_into().unwrap_or([0; 2]);
        u16::from_le_bytes(bytes)
    }

    /// Reads a u32 at `off`.
    #[inline]
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        let bytes: [u8; 4] = src[off..off + 4].try_into().unwrap_or([0; 4]);
        u32::from_le_bytes(bytes)
    }

    /// Reads a u64 at `off`.
    #[inline]
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let bytes: [u8; 8] = src[off..off + 8].try_into().unwrap_or([0; 8]);
        u64::from_le_bytes(bytes)
    }

    /// Writes a u16 at `off`.
    #[inline]
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u32 at `off`.
    #[inline]
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u64 at `off`.
    #[inline]
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

pub mod align {
    //! Alignment helpers for segment and block sizes.

    use crate::types::block::ALIGN;

    /// Rounds `n` up to the alignment unit.
    #[inline]
    pub const fn align_up(n: usize) -> usize {
        (n + ALIGN - 1) & !(ALIGN - 1)
    }

    /// Rounds `n` down to the alignment unit.
    #[inline]
    pub const fn align_down(n: usize) -> usize {
        n & !(ALIGN - 1)
    }

    /// Returns true when `n` is a multiple of the alignment unit.
    #[inline]
    pub const fn is_aligned(n: usize) -> bool {
        n & (ALIGN - 1) == 0
    }
}

pub mod var {
    //! Unsigned varints.

    use crate::types::{Result, TreeError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            } else {
                out.push(byte | 0x80);
            }
        }
    }

    /// Number of bytes [`encode_u64`] produces for `v`.
    pub fn encoded_len(mut v: u64) -> usize {
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    /// Decodes a varint from `src` at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(TreeError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(TreeError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(TreeError::Corruption("varint longer than 10 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_fields_roundtrip() {
        let mut buf = [0u8; 16];
        le::put_u16(&mut buf, 0, 0xBEEF);
        le::put_u32(&mut buf, 2, 0xDEAD_BEEF);
        le::put_u64(&mut buf, 8, u64::MAX - 1);
        assert_eq!(le::get_u16(&buf, 0), 0xBEEF);
        assert_eq!(le::get_u32(&buf, 2), 0xDEAD_BEEF);
        assert_eq!(le::get_u64(&buf, 8), u64::MAX - 1);
    }

    #[test]
    fn alignment_rounds_to_eight() {
        assert_eq!(align::align_up(0), 0);
        assert_eq!(align::align_up(1), 8);
        assert_eq!(align::align_up(8), 8);
        assert_eq!(align::align_up(13), 16);
        assert_eq!(align::align_down(15), 8);
        assert!(align::is_aligned(24));
        assert!(!align::is_aligned(25));
    }

    #[test]
    fn varint_lengths_match_encoding() {
        for v in [0u64, 1, 127, 128, 300, 1 << 35, u64::MAX] {
            let mut out = Vec::new();
            var::encode_u64(v, &mut out);
            assert_eq!(out.len(), var::encoded_len(v));
            let mut off = 0;
            assert_eq!(var::decode_u64(&out, &mut off).unwrap(), v);
            assert_eq!(off, out.len());
        }
    }

    #[test]
    fn varint_decode_reports_truncation() {
        let mut off = 0;
        assert!(var::decode_u64(&[0x80, 0x80], &mut off).is_err());
    }
}
