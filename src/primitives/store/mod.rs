#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{BlockId, CtrId, StoreError};

mod memory;

pub use memory::{MemStore, MemStoreOptions};

/// Result alias for block store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared handle to the bytes of one block.
///
/// Handles are cheap to clone; every clone observes the same bytes, including
/// resizes performed through the store.
#[derive(Clone)]
pub struct BlockHandle {
    id: BlockId,
    data: Arc<RwLock<Vec<u8>>>,
}

impl BlockHandle {
    pub(crate) fn new(id: BlockId, data: Arc<RwLock<Vec<u8>>>) -> Self {
        Self { id, data }
    }

    /// Block identifier.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Locks the block for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Locks the block for writing. Tree code reaches this only through
    /// exclusive nodes.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Current length of the block in bytes.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true when the block has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the block's bytes out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub(crate) fn shares_memory_with(&self, other: &BlockHandle) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Counters reported by a block store.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Blocks currently allocated.
    pub live_blocks: u64,
    /// Bytes currently allocated.
    pub live_bytes: u64,
    /// Blocks created, including clones.
    pub allocations: u64,
    /// Blocks freed.
    pub frees: u64,
    /// Blocks created by cloning.
    pub clones: u64,
    /// Resize calls served.
    pub resizes: u64,
}

/// Storage for node blocks.
///
/// The tree consumes the store only through this trait. Reference counts
/// decide sharing: a block whose count is above one is shared and must be
/// cloned before it is written.
pub trait BlockStore: Send + Sync {
    /// Allocates a zeroed block of `size` bytes with a reference count of one.
    fn create_block(&self, size: usize, owner: CtrId) -> StoreResult<BlockHandle>;

    /// Grows or shrinks a block in place; new bytes are zeroed.
    fn resize_block(&self, handle: &BlockHandle, new_size: usize) -> StoreResult<()>;

    /// Looks up a block for reading.
    fn get_block(&self, id: BlockId) -> StoreResult<BlockHandle>;

    /// Looks up a block the caller intends to write; fails for shared blocks.
    fn get_block_for_update(&self, id: BlockId) -> StoreResult<BlockHandle> {
        if self.is_shared(id)? {
            return Err(StoreError::Shared(id));
        }
        self.get_block(id)
    }

    /// Copies a block into a fresh block with a reference count of one.
    fn clone_block(&self, id: BlockId) -> StoreResult<BlockHandle>;

    /// Drops a block regardless of its reference count.
    fn free_block(&self, id: BlockId) -> StoreResult<()>;

    /// Adds one reference.
    fn ref_block(&self, id: BlockId) -> StoreResult<()>;

    /// Drops one reference and returns how many remain.
    ///
    /// The block is not freed when the count reaches zero; the caller decides
    /// what to do with its children first.
    fn unref_block(&self, id: BlockId) -> StoreResult<u32>;

    /// Current reference count.
    fn ref_count(&self, id: BlockId) -> StoreResult<u32>;

    /// Returns true when more than one owner references the block.
    fn is_shared(&self, id: BlockId) -> StoreResult<bool> {
        Ok(self.ref_count(id)? > 1)
    }

    /// Returns a snapshot of store statistics.
    fn stats(&self) -> StoreStats;
}
