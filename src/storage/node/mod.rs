#![forbid(unsafe_code)]

//! Node variants, their packed-layout formats and type-tag dispatch.
//!
//! Every node is a block starting with the fixed [`NodeHeader`] followed by
//! a [`PackedLayout`]. Segments 0 to 2 hold root metadata, properties and
//! extension data and are empty outside the root; the variant's streams
//! follow.
//!
//! [`NodeHeader`]: crate::types::block::NodeHeader
//! [`PackedLayout`]: crate::storage::packed::PackedLayout

pub mod branch;
pub mod common;
pub mod dispatch;
pub mod leaf_bitmap;
pub mod leaf_map;
pub mod registry;

pub use branch::{BitmapBranch, Branch, KeyAgg, MapBranch};
pub use common::{
    open_layout, open_layout_mut, ExtData, NodeLayout, RootMetadata, Summary, EXT_DATA,
    FIRST_STREAM, METADATA, PROPERTIES, ROOT_SEGMENTS,
};
pub use dispatch::{
    dispatch_shape, Capacity, CheckNode, ChildrenOf, InitLayout, MergeFrom, MergeGrowth,
    NodeVisitor, NodeVisitorMut, PairVisitor, PairVisitorMut, RemoveUnits, ShapeVisitor, SizeOf,
    SplitTo, StreamBytes, Streams, SummaryOf, SummaryRange,
};
pub use leaf_bitmap::BitmapLeaf;
pub use leaf_map::MapLeaf;
pub use registry::{fixed_overhead, NodeKind, NodeType, Registry, ShapeTable};
