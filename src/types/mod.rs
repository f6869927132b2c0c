#![forbid(unsafe_code)]
//! Identifiers, error types and the fixed node header shared by every layer.

use std::fmt;

pub mod checksum;

pub use checksum::block_crc32;

/// Opaque identifier of a block handed out by a [`BlockStore`](crate::primitives::store::BlockStore).
///
/// Zero is reserved as the null id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockId(pub u64);

impl BlockId {
    /// The null block id, never allocated by a store.
    pub const NULL: BlockId = BlockId(0);

    /// Returns true when this is the null id.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Logical container name stored in root metadata.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct CtrId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CtrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CtrId {
    fn from(value: u64) -> Self {
        CtrId(value)
    }
}

/// Errors reported by a block store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The block id is unknown to the store.
    #[error("block {0} not found")]
    NotFound(BlockId),
    /// The store cannot hand out more memory.
    #[error("store exhausted: requested {requested} bytes, limit {limit}")]
    Exhausted {
        /// Bytes the failing call asked for.
        requested: usize,
        /// Configured capacity of the store.
        limit: usize,
    },
    /// The requested block size is not usable.
    #[error("invalid block size {0}")]
    InvalidSize(usize),
    /// An update handle was requested for a block that is shared.
    #[error("block {0} is shared")]
    Shared(BlockId),
}

/// Errors raised by the tree core.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// A segment or block cannot grow within the current limits.
    #[error("out of space: need {needed} bytes, {available} available")]
    OutOfSpace {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes that were available.
        available: usize,
    },
    /// A block's type tag matches no registered node variant.
    #[error("unknown node type tag {0:#018x}")]
    UnknownNodeType(u64),
    /// A structural invariant does not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Error propagated unchanged from the block store.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Block contents failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options could not be parsed or validated.
    #[error("configuration: {0}")]
    Config(String),
}

impl TreeError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        TreeError::InvariantViolation(message.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

pub mod block {
    //! Fixed header at the start of every node block.

    use crate::primitives::bytes::le;

    use super::{Result, TreeError};

    /// Length of the node header in bytes.
    pub const NODE_HDR_LEN: usize = 16;
    /// Alignment unit for block sizes and segment boundaries.
    pub const ALIGN: usize = 8;
    /// Default block size for freshly created trees.
    pub const DEFAULT_BLOCK_SIZE: usize = 8192;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// xxh64 tag of the node variant.
        pub const TYPE_TAG: Range<usize> = 0..8;
        /// Height above the leaves; leaves are level 0.
        pub const LEVEL: Range<usize> = 8..10;
        /// Root and leaf flag bits.
        pub const FLAGS: usize = 10;
        /// Always zero.
        pub const RESERVED: usize = 11;
        /// Declared block size in bytes.
        pub const BLOCK_SIZE: Range<usize> = 12..16;
    }

    const FLAG_ROOT: u8 = 0b01;
    const FLAG_LEAF: u8 = 0b10;

    /// Decoded node header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct NodeHeader {
        /// Type tag selecting the node variant.
        pub type_tag: u64,
        /// Tree level, 0 for leaves.
        pub level: u16,
        /// Whether the node is the tree root.
        pub root: bool,
        /// Whether the node is a leaf.
        pub leaf: bool,
        /// Declared size of the backing block.
        pub block_size: u32,
    }

    impl NodeHeader {
        /// Creates a header for a block of `block_size` bytes.
        pub fn new(type_tag: u64, level: u16, root: bool, leaf: bool, block_size: usize) -> Result<Self> {
            if block_size < NODE_HDR_LEN || block_size % ALIGN != 0 {
                return Err(TreeError::Invalid("block size not aligned or smaller than header"));
            }
            let block_size =
                u32::try_from(block_size).map_err(|_| TreeError::Invalid("block size exceeds u32"))?;
            Ok(Self {
                type_tag,
                level,
                root,
                leaf,
                block_size,
            })
        }

        /// Decodes the header from the first bytes of `block`.
        pub fn decode(block: &[u8]) -> Result<Self> {
            if block.len() < NODE_HDR_LEN {
                return Err(TreeError::Corruption("block shorter than node header"));
            }
            let flags = block[header::FLAGS];
            if flags & !(FLAG_ROOT | FLAG_LEAF) != 0 || block[header::RESERVED] != 0 {
                return Err(TreeError::Corruption("node header has unknown flag bits"));
            }
            let hdr = Self {
                type_tag: le::get_u64(block, header::TYPE_TAG.start),
                level: le::get_u16(block, header::LEVEL.start),
                root: flags & FLAG_ROOT != 0,
                leaf: flags & FLAG_LEAF != 0,
                block_size: le::get_u32(block, header::BLOCK_SIZE.start),
            };
            if hdr.block_size as usize != block.len() {
                return Err(TreeError::Corruption("declared block size differs from block length"));
            }
            if hdr.leaf != (hdr.level == 0) {
                return Err(TreeError::Corruption("leaf flag inconsistent with level"));
            }
            Ok(hdr)
        }

        /// Encodes the header into the first bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < NODE_HDR_LEN {
                return Err(TreeError::Invalid("node header buffer too small"));
            }
            le::put_u64(dst, header::TYPE_TAG.start, self.type_tag);
            le::put_u16(dst, header::LEVEL.start, self.level);
            let mut flags = 0u8;
            if self.root {
                flags |= FLAG_ROOT;
            }
            if self.leaf {
                flags |= FLAG_LEAF;
            }
            dst[header::FLAGS] = flags;
            dst[header::RESERVED] = 0;
            le::put_u32(dst, header::BLOCK_SIZE.start, self.block_size);
            Ok(())
        }
    }

    /// Rewrites only the root flag of an encoded header.
    pub fn set_root_flag(block: &mut [u8], root: bool) {
        if root {
            block[header::FLAGS] |= FLAG_ROOT;
        } else {
            block[header::FLAGS] &= !FLAG_ROOT;
        }
    }

    /// Rewrites only the declared block size of an encoded header.
    pub fn set_block_size(block: &mut [u8], size: u32) {
        le::put_u32(block, header::BLOCK_SIZE.start, size);
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn header_roundtrip_is_bit_exact() {
            let hdr = NodeHeader::new(0xDEAD_BEEF_0102_0304, 3, true, false, 8192).unwrap();
            let mut buf = vec![0u8; 8192];
            hdr.encode(&mut buf).unwrap();
            assert_eq!(&buf[0..8], &0xDEAD_BEEF_0102_0304u64.to_le_bytes());
            assert_eq!(&buf[8..10], &3u16.to_le_bytes());
            assert_eq!(buf[10], 0b01);
            assert_eq!(&buf[12..16], &8192u32.to_le_bytes());
            assert_eq!(NodeHeader::decode(&buf).unwrap(), hdr);
        }

        #[test]
        fn decode_rejects_leaf_flag_on_branch_level() {
            let mut buf = vec![0u8; 64];
            NodeHeader::new(1, 2, false, false, 64)
                .unwrap()
                .encode(&mut buf)
                .unwrap();
            buf[10] = 0b10;
            assert!(matches!(
                NodeHeader::decode(&buf),
                Err(TreeError::Corruption(_))
            ));
        }

        #[test]
        fn flag_helpers_touch_only_their_field() {
            let mut buf = vec![0u8; 64];
            NodeHeader::new(7, 0, false, true, 64)
                .unwrap()
                .encode(&mut buf)
                .unwrap();
            set_root_flag(&mut buf, true);
            let hdr = NodeHeader::decode(&buf).unwrap();
            assert!(hdr.root && hdr.leaf);
            assert_eq!(hdr.type_tag, 7);
        }

        #[test]
        fn header_fields_tile_the_header() {
            assert_eq!(header::TYPE_TAG.start, 0);
            assert_eq!(header::TYPE_TAG.end, header::LEVEL.start);
            assert_eq!(header::LEVEL.end, header::FLAGS);
            assert_eq!(header::FLAGS + 1, header::RESERVED);
            assert_eq!(header::RESERVED + 1, header::BLOCK_SIZE.start);
            assert_eq!(header::BLOCK_SIZE.end, NODE_HDR_LEN);

            let mut buf = vec![0xFFu8; 64];
            NodeHeader::new(1, 0, true, true, 64)
                .unwrap()
                .encode(&mut buf)
                .unwrap();
            assert_eq!(buf[header::RESERVED], 0);
        }
    }
}
