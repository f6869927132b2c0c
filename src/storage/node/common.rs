use crate::primitives::bytes::le;
use crate::storage::packed::{LayoutMut, LayoutRef, PackedLayout};
use crate::types::block::NODE_HDR_LEN;
use crate::types::{BlockId, CtrId, Result, TreeError};

use super::registry::NodeKind;

/// Segment holding [`RootMetadata`]; empty outside the root.
pub const METADATA: usize = 0;
/// Segment holding container properties; empty outside the root.
pub const PROPERTIES: usize = 1;
/// Segment holding [`ExtData`]; empty outside the root.
pub const EXT_DATA: usize = 2;
/// First variant-specific segment.
pub const FIRST_STREAM: usize = 3;
/// Names of the segments every node carries before its streams.
pub const ROOT_SEGMENTS: [&str; FIRST_STREAM] = ["metadata", "properties", "ext_data"];

/// Encoded length of [`RootMetadata`].
pub const METADATA_LEN: usize = 16;
/// Encoded length of [`ExtData`].
pub const EXT_DATA_LEN: usize = 16;
/// Root segment bytes of a root with no properties.
pub const ROOT_SEGMENT_BYTES: usize = METADATA_LEN + EXT_DATA_LEN;

/// Aggregate a node reports to its parent.
///
/// For map nodes `key` is the largest key; for bitmap nodes it is the number
/// of set bits. `size` counts entries or bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Aggregated key.
    pub key: u64,
    /// Number of content units below the node.
    pub size: u64,
}

impl Summary {
    /// Creates a summary.
    pub const fn new(key: u64, size: u64) -> Self {
        Self { key, size }
    }
}

/// Per-container metadata kept in the root node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootMetadata {
    /// Logical container name.
    pub name: CtrId,
    /// Block size for new nodes; zero when unset.
    pub block_size: u32,
}

impl RootMetadata {
    /// Encodes into the fixed 16-byte record.
    pub fn encode(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        le::put_u64(&mut out, 0, self.name.0);
        le::put_u32(&mut out, 8, self.block_size);
        out
    }

    /// Decodes the fixed 16-byte record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != METADATA_LEN {
            return Err(TreeError::Corruption("root metadata has wrong length"));
        }
        if le::get_u32(bytes, 12) != 0 {
            return Err(TreeError::Corruption("root metadata reserved field set"));
        }
        Ok(Self {
            name: CtrId(le::get_u64(bytes, 0)),
            block_size: le::get_u32(bytes, 8),
        })
    }
}

/// Node variants of the container, stored in the root so a tree can be
/// reopened from its root block alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtData {
    /// Type tag of branch nodes.
    pub branch_tag: u64,
    /// Type tag of leaf nodes.
    pub leaf_tag: u64,
}

impl ExtData {
    /// Encodes into the fixed 16-byte record.
    pub fn encode(&self) -> [u8; EXT_DATA_LEN] {
        let mut out = [0u8; EXT_DATA_LEN];
        le::put_u64(&mut out, 0, self.branch_tag);
        le::put_u64(&mut out, 8, self.leaf_tag);
        out
    }

    /// Decodes the fixed 16-byte record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EXT_DATA_LEN {
            return Err(TreeError::Corruption("extension data has wrong length"));
        }
        Ok(Self {
            branch_tag: le::get_u64(bytes, 0),
            leaf_tag: le::get_u64(bytes, 8),
        })
    }
}

/// Concrete content layout of one node variant.
///
/// Implemented by zero-sized marker types; dispatch picks the implementation
/// from the block's type tag. "Units" are children for branches, entries for
/// map leaves and bits for bitmap leaves.
pub trait NodeLayout {
    /// Variant this layout implements.
    const KIND: NodeKind;
    /// Names of the variant's segments after the root segments.
    const STREAMS: &'static [&'static str];

    /// Writes empty streams into a freshly initialised layout.
    fn init(layout: &mut LayoutMut<'_>) -> Result<()>;

    /// Number of content units.
    fn size(layout: &LayoutRef<'_>) -> Result<usize>;

    /// Aggregate over the whole node.
    fn summary(layout: &LayoutRef<'_>) -> Result<Summary>;

    /// Aggregate over units `start..end`.
    fn summary_range(layout: &LayoutRef<'_>, start: usize, end: usize) -> Result<Summary>;

    /// Moves units `at..` from `src` to the end of `dst`.
    fn split_to(src: &mut LayoutMut<'_>, dst: &mut LayoutMut<'_>, at: usize) -> Result<()>;

    /// Extra allocation `dst` needs before [`merge_from`](Self::merge_from).
    fn merge_growth(dst: &LayoutRef<'_>, src: &LayoutRef<'_>) -> Result<usize>;

    /// Appends every unit of `src` to `dst`.
    fn merge_from(dst: &mut LayoutMut<'_>, src: &LayoutRef<'_>) -> Result<()>;

    /// Drops units `start..end`. Branches leave the references held by the
    /// dropped children to the caller.
    fn remove_units(layout: &mut LayoutMut<'_>, start: usize, end: usize) -> Result<()>;

    /// Calls `f` for every child block; leaves have none.
    fn for_each_child(_layout: &LayoutRef<'_>, _f: &mut dyn FnMut(BlockId)) -> Result<()> {
        Ok(())
    }

    /// Validates internal invariants of the streams.
    fn check(layout: &LayoutRef<'_>) -> Result<()>;

    /// Compacted stream bytes needed to hold `units` units.
    fn stream_bytes(units: usize) -> usize;
}

/// Opens the packed layout that follows the node header.
pub fn open_layout(block: &[u8]) -> Result<LayoutRef<'_>> {
    if block.len() < NODE_HDR_LEN {
        return Err(TreeError::Corruption("block shorter than node header"));
    }
    PackedLayout::open(&block[NODE_HDR_LEN..])
}

/// Opens the packed layout that follows the node header for writing.
pub fn open_layout_mut(block: &mut [u8]) -> Result<LayoutMut<'_>> {
    if block.len() < NODE_HDR_LEN {
        return Err(TreeError::Corruption("block shorter than node header"));
    }
    PackedLayout::open(&mut block[NODE_HDR_LEN..])
}
