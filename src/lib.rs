//! Copy-on-write B-tree structural core.
//!
//! Nodes live in variable-size blocks obtained from a
//! [`BlockStore`](primitives::store::BlockStore). Each block carries a fixed
//! header and a packed layout of named segments. Trees share blocks by
//! reference count, so a fork is a single increment and writes clone only
//! the nodes on their path.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::store::{BlockHandle, BlockStore, MemStore, MemStoreOptions};
pub use storage::{
    AllocationBitmap, ContainerProfile, CowMap, NodeKind, Registry, Tree, TreeOptions,
};
pub use types::{BlockId, CtrId, Result, StoreError, TreeError};
