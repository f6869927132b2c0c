//! Closed set of node variants, their registry entries and the per-shape
//! capacity table.

use std::fmt;

use rustc_hash::FxHashMap;
use xxhash_rust::xxh64::xxh64;

use crate::storage::packed::{DESCRIPTOR_LEN, LAYOUT_HDR_LEN};
use crate::types::block::NODE_HDR_LEN;
use crate::types::{Result, TreeError};

use super::common::{FIRST_STREAM, ROOT_SEGMENTS, ROOT_SEGMENT_BYTES};
use super::dispatch::{dispatch_shape, Capacity, StreamBytes, Streams};

/// Node variants known to the tree core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    /// Branch of an ordered map; keys aggregate by maximum.
    MapBranch,
    /// Leaf of an ordered map.
    MapLeaf,
    /// Branch of a bitmap; keys aggregate by sum.
    BitmapBranch,
    /// Leaf of a bitmap.
    BitmapLeaf,
}

impl NodeKind {
    /// Every variant, in registry order.
    pub const ALL: [NodeKind; 4] = [
        NodeKind::MapBranch,
        NodeKind::MapLeaf,
        NodeKind::BitmapBranch,
        NodeKind::BitmapLeaf,
    ];

    /// Stable variant name; the type tag is derived from it.
    pub const fn name(self) -> &'static str {
        match self {
            NodeKind::MapBranch => "cowtree.map.branch",
            NodeKind::MapLeaf => "cowtree.map.leaf",
            NodeKind::BitmapBranch => "cowtree.bitmap.branch",
            NodeKind::BitmapLeaf => "cowtree.bitmap.leaf",
        }
    }

    /// Type tag written into the node header.
    pub fn tag(self) -> u64 {
        xxh64(self.name().as_bytes(), 0)
    }

    /// Returns true for leaf variants.
    pub const fn is_leaf(self) -> bool {
        matches!(self, NodeKind::MapLeaf | NodeKind::BitmapLeaf)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry entry describing one node variant.
#[derive(Clone, Debug)]
pub struct NodeType {
    /// Variant.
    pub kind: NodeKind,
    /// Variant name.
    pub name: &'static str,
    /// Header type tag.
    pub tag: u64,
    /// Whether nodes of this type are leaves.
    pub leaf: bool,
    /// Names of every segment, root segments first.
    pub segments: Vec<&'static str>,
}

impl NodeType {
    fn new(kind: NodeKind) -> Self {
        let mut segments: Vec<&'static str> = ROOT_SEGMENTS.to_vec();
        segments.extend_from_slice(dispatch_shape(kind, Streams));
        Self {
            kind,
            name: kind.name(),
            tag: kind.tag(),
            leaf: kind.is_leaf(),
            segments,
        }
    }

    /// Number of segment slots in the packed layout.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Index of the segment called `name`.
    pub fn segment_index(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|seg| *seg == name)
    }

    /// Name of segment `idx`.
    pub fn segment_name(&self, idx: usize) -> Option<&'static str> {
        self.segments.get(idx).copied()
    }

    /// Number of variant streams after the root segments.
    pub fn stream_count(&self) -> usize {
        self.segments.len() - FIRST_STREAM
    }
}

/// Lookup table from type tag to node type.
///
/// Built once with [`Registry::standard`] and shared by `Arc` between every
/// tree that uses it.
#[derive(Debug)]
pub struct Registry {
    types: Vec<NodeType>,
    by_tag: FxHashMap<u64, usize>,
}

impl Registry {
    /// Registry holding every [`NodeKind`].
    pub fn standard() -> Self {
        let types: Vec<NodeType> = NodeKind::ALL.iter().map(|kind| NodeType::new(*kind)).collect();
        let by_tag = types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (ty.tag, idx))
            .collect();
        Self { types, by_tag }
    }

    /// Node type registered under `tag`.
    pub fn lookup(&self, tag: u64) -> Result<&NodeType> {
        self.by_tag
            .get(&tag)
            .map(|idx| &self.types[*idx])
            .ok_or(TreeError::UnknownNodeType(tag))
    }

    /// Node type of `kind`.
    pub fn node_type(&self, kind: NodeKind) -> &NodeType {
        &self.types[kind as usize]
    }

    /// Every registered type.
    pub fn types(&self) -> &[NodeType] {
        &self.types
    }
}

/// Bytes a node of `kind` spends outside its streams.
pub fn fixed_overhead(kind: NodeKind, root: bool) -> usize {
    let streams = dispatch_shape(kind, Streams).len();
    let root_bytes = if root { ROOT_SEGMENT_BYTES } else { 0 };
    NODE_HDR_LEN + LAYOUT_HDR_LEN + DESCRIPTOR_LEN * (FIRST_STREAM + streams) + root_bytes
}

/// Structural capacity, in units, per node shape.
///
/// Entries exist for every power-of-two block size between the floor and the
/// maximum; other sizes are computed on demand.
#[derive(Debug, Clone)]
pub struct ShapeTable {
    min_block_size: usize,
    max_block_size: usize,
    capacity: FxHashMap<(NodeKind, bool, usize), usize>,
}

impl ShapeTable {
    /// Builds the table for sizes `min..=max`.
    pub fn build(min_block_size: usize, max_block_size: usize) -> Self {
        let mut capacity = FxHashMap::default();
        for kind in NodeKind::ALL {
            for root in [false, true] {
                let mut size = min_block_size;
                while size <= max_block_size && size > 0 {
                    capacity.insert((kind, root, size), compute_capacity(kind, root, size));
                    size *= 2;
                }
            }
        }
        Self {
            min_block_size,
            max_block_size,
            capacity,
        }
    }

    /// Units a node of `kind` can hold in a block of `block_size` bytes.
    pub fn capacity(&self, kind: NodeKind, root: bool, block_size: usize) -> usize {
        self.capacity
            .get(&(kind, root, block_size))
            .copied()
            .unwrap_or_else(|| compute_capacity(kind, root, block_size))
    }

    /// Units a node of `kind` can hold at the maximum block size.
    pub fn max_capacity(&self, kind: NodeKind, root: bool) -> usize {
        self.capacity(kind, root, self.max_block_size)
    }

    /// Smallest block size the table covers.
    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    /// Largest block size the table covers.
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Block bytes a compacted node of `kind` with `units` units occupies.
    pub fn bytes_needed(&self, kind: NodeKind, root: bool, units: usize) -> usize {
        fixed_overhead(kind, root) + dispatch_shape(kind, StreamBytes { units })
    }
}

fn compute_capacity(kind: NodeKind, root: bool, block_size: usize) -> usize {
    dispatch_shape(
        kind,
        Capacity {
            avail: block_size.saturating_sub(fixed_overhead(kind, root)),
        },
    )
}
