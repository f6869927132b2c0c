use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{BlockHandle, BlockStore, StoreResult, StoreStats};
use crate::types::block::ALIGN;
use crate::types::{BlockId, CtrId, StoreError};

/// Configuration for [`MemStore`].
#[derive(Clone, Debug, Default)]
pub struct MemStoreOptions {
    /// Upper bound on live bytes; `None` means unbounded.
    pub capacity_bytes: Option<usize>,
}

struct Slot {
    data: Arc<RwLock<Vec<u8>>>,
    refs: u32,
    owner: CtrId,
}

#[derive(Default)]
struct StoreInner {
    blocks: FxHashMap<BlockId, Slot>,
    next_id: u64,
    live_bytes: usize,
    stats: StoreStats,
}

/// In-memory, reference-counted block store.
pub struct MemStore {
    options: MemStoreOptions,
    inner: Mutex<StoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(MemStoreOptions::default())
    }
}

impl MemStore {
    /// Creates an empty store.
    pub fn new(options: MemStoreOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(StoreInner {
                next_id: 1,
                ..StoreInner::default()
            }),
        }
    }

    /// Ids of every live block, sorted.
    pub fn live_ids(&self) -> Vec<BlockId> {
        let inner = self.inner.lock();
        let mut ids: Vec<BlockId> = inner.blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Owner recorded when the block was created.
    pub fn owner(&self, id: BlockId) -> StoreResult<CtrId> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&id)
            .map(|slot| slot.owner)
            .ok_or(StoreError::NotFound(id))
    }

    fn check_size(size: usize) -> StoreResult<()> {
        if size == 0 || size % ALIGN != 0 || size > u32::MAX as usize {
            return Err(StoreError::InvalidSize(size));
        }
        Ok(())
    }

    fn reserve(&self, inner: &StoreInner, extra: usize) -> StoreResult<()> {
        if let Some(limit) = self.options.capacity_bytes {
            if inner.live_bytes + extra > limit {
                return Err(StoreError::Exhausted {
                    requested: extra,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn insert(inner: &mut StoreInner, data: Vec<u8>, owner: CtrId) -> BlockHandle {
        let id = BlockId(inner.next_id);
        inner.next_id += 1;
        let len = data.len();
        let data = Arc::new(RwLock::new(data));
        inner.blocks.insert(
            id,
            Slot {
                data: Arc::clone(&data),
                refs: 1,
                owner,
            },
        );
        inner.live_bytes += len;
        inner.stats.allocations += 1;
        BlockHandle::new(id, data)
    }
}

impl BlockStore for MemStore {
    fn create_block(&self, size: usize, owner: CtrId) -> StoreResult<BlockHandle> {
        Self::check_size(size)?;
        let mut inner = self.inner.lock();
        self.reserve(&inner, size)?;
        Ok(Self::insert(&mut inner, vec![0u8; size], owner))
    }

    fn resize_block(&self, handle: &BlockHandle, new_size: usize) -> StoreResult<()> {
        Self::check_size(new_size)?;
        let mut inner = self.inner.lock();
        let data = inner
            .blocks
            .get(&handle.id())
            .map(|slot| Arc::clone(&slot.data))
            .ok_or(StoreError::NotFound(handle.id()))?;
        let old_size = data.read().len();
        if new_size > old_size {
            self.reserve(&inner, new_size - old_size)?;
        }
        data.write().resize(new_size, 0);
        inner.live_bytes = inner.live_bytes + new_size - old_size;
        inner.stats.resizes += 1;
        Ok(())
    }

    fn get_block(&self, id: BlockId) -> StoreResult<BlockHandle> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&id)
            .map(|slot| BlockHandle::new(id, Arc::clone(&slot.data)))
            .ok_or(StoreError::NotFound(id))
    }

    fn clone_block(&self, id: BlockId) -> StoreResult<BlockHandle> {
        let mut inner = self.inner.lock();
        let (bytes, owner) = {
            let slot = inner.blocks.get(&id).ok_or(StoreError::NotFound(id))?;
            let bytes = slot.data.read().clone();
            (bytes, slot.owner)
        };
        self.reserve(&inner, bytes.len())?;
        inner.stats.clones += 1;
        Ok(Self::insert(&mut inner, bytes, owner))
    }

    fn free_block(&self, id: BlockId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.blocks.remove(&id).ok_or(StoreError::NotFound(id))?;
        let len = slot.data.read().len();
        inner.live_bytes -= len;
        inner.stats.frees += 1;
        Ok(())
    }

    fn ref_block(&self, id: BlockId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.blocks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        slot.refs += 1;
        Ok(())
    }

    fn unref_block(&self, id: BlockId) -> StoreResult<u32> {
        let mut inner = self.inner.lock();
        let slot = inner.blocks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        slot.refs = slot.refs.saturating_sub(1);
        Ok(slot.refs)
    }

    fn ref_count(&self, id: BlockId) -> StoreResult<u32> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&id)
            .map(|slot| slot.refs)
            .ok_or(StoreError::NotFound(id))
    }

    fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            live_blocks: inner.blocks.len() as u64,
            live_bytes: inner.live_bytes as u64,
            ..inner.stats
        }
    }
}
