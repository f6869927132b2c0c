//! Copy-on-write tree storage.
//!
//! Implements the packed block layout, the node variants stored in it, the
//! tree core that splits, merges and clones nodes, and the containers built
//! on top.

/// Copy-on-write B-tree core.
///
/// Node lifecycle, block sizing, tree paths and structural mutations.
pub mod btree;

/// Containers built on the tree core.
///
/// An ordered map and an allocation bitmap.
pub mod containers;

/// Node variants and type-tag dispatch.
pub mod node;

/// Packed segment layout and typed segment formats.
pub mod packed;

pub use btree::{
    ContainerProfile, NodeSizing, PathRepair, StructuralMutation, Tree, TreeOptions, TreePath,
    TreeStats, TreeStatsSnapshot, VerifyReport,
};
pub use containers::{AllocationBitmap, CowMap};
pub use node::{NodeKind, Registry, Summary};
