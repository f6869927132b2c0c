#![forbid(unsafe_code)]
//! CRC32 of block contents for block descriptions.

/// CRC32 of a block's bytes with the id mixed in, so equal contents under
/// different ids do not collide.
pub fn block_crc32(block_id: u64, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block_id.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}
