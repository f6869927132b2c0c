use std::sync::Arc;

use crate::primitives::store::BlockStore;
use crate::storage::btree::{
    ContainerProfile, NodeSizing, PathRepair, StructuralMutation, Tree, TreeOptions, TreePath,
};
use crate::storage::node::{branch, leaf_bitmap, Registry};
use crate::storage::packed::Prepared;
use crate::types::{BlockId, CtrId, Result, TreeError};

/// Growable bitmap with rank, select and first-fit allocation.
///
/// Leaves hold bit arrays with a popcount index; branches store the set-bit
/// count and the length of each child, so positional descent, rank and
/// select all run in one root-to-leaf pass. Bits are added at the tail
/// only.
pub struct AllocationBitmap {
    tree: Tree,
}

impl AllocationBitmap {
    /// Creates an empty bitmap with default options.
    pub fn create(store: Arc<dyn BlockStore>, name: CtrId) -> Result<Self> {
        Self::create_with(
            store,
            Arc::new(Registry::standard()),
            TreeOptions::default(),
            name,
        )
    }

    /// Creates an empty bitmap.
    pub fn create_with(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        name: CtrId,
    ) -> Result<Self> {
        let tree = Tree::create(store, registry, options, name, ContainerProfile::BITMAP)?;
        Ok(Self { tree })
    }

    /// Opens the bitmap rooted at `root`.
    pub fn open(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        root: BlockId,
    ) -> Result<Self> {
        let tree = Tree::open(store, registry, options, root)?;
        if tree.profile() != ContainerProfile::BITMAP {
            tree.release()?;
            return Err(TreeError::Invalid("root does not belong to a bitmap"));
        }
        Ok(Self { tree })
    }

    /// Returns an isolated snapshot sharing every block with this bitmap.
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            tree: self.tree.fork()?,
        })
    }

    /// Drops this handle's blocks.
    pub fn release(self) -> Result<()> {
        self.tree.release()
    }

    /// Underlying tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Underlying tree, writable.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    fn totals(&self) -> Result<(u64, u64)> {
        let root = self.tree.load(self.tree.root())?;
        let summary = self.tree.node_summary(&root)?;
        Ok((summary.key, summary.size))
    }

    /// Number of bits.
    pub fn len(&self) -> Result<u64> {
        Ok(self.totals()?.1)
    }

    /// Returns true when the bitmap holds no bit.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> Result<u64> {
        Ok(self.totals()?.0)
    }

    /// Path to the leaf holding bit `pos`, the bit's offset in that leaf and
    /// the set bits in every leaf before it.
    fn locate(&self, pos: u64) -> Result<(TreePath, usize, u64)> {
        let mut local = pos;
        let mut ones_before = 0u64;
        let path = self.tree.descend_path(|layout| {
            let (idx, before) = branch::find_position(layout, local)?
                .ok_or(TreeError::Invalid("bit position out of range"))?;
            local -= before;
            ones_before += branch::prefix_keys(layout, idx);
            Ok(idx)
        })?;
        let local = usize::try_from(local).map_err(|_| TreeError::Invalid("bit position out of range"))?;
        Ok((path, local, ones_before))
    }

    /// Bit at `pos`, or `None` past the end.
    pub fn get(&self, pos: u64) -> Result<Option<bool>> {
        if pos >= self.len()? {
            return Ok(None);
        }
        let (path, local, _) = self.locate(pos)?;
        self.tree
            .with_layout(path.leaf()?, |_, layout| leaf_bitmap::get(layout, local))
    }

    /// Sets bit `pos` and returns its previous value.
    pub fn set(&mut self, pos: u64, value: bool) -> Result<bool> {
        if pos >= self.len()? {
            return Err(TreeError::Invalid("bit position out of range"));
        }
        let (mut path, local, _) = self.locate(pos)?;
        let current = self
            .tree
            .with_layout(path.leaf()?, |_, layout| leaf_bitmap::get(layout, local))?
            .ok_or_else(|| TreeError::invariant("leaf shorter than its parent entry"))?;
        if current == value {
            return Ok(current);
        }
        let tree = &mut self.tree;
        tree.make_mutable(&mut path, 0)?;
        let leaf = path.leaf()?.clone();
        let old = tree.update_layout(&leaf, |_, layout| leaf_bitmap::set(layout, local, value))?;
        tree.update_path(&mut path, 0)?;
        Ok(old)
    }

    /// Appends `count` copies of `value` at the tail.
    ///
    /// The last leaf grows until it reaches the maximum block size; only then
    /// is a new, empty leaf split off after it.
    pub fn append(&mut self, count: u64, value: bool) -> Result<()> {
        let mut remaining =
            usize::try_from(count).map_err(|_| TreeError::Invalid("append count too large"))?;
        let tree = &mut self.tree;
        let mut path = tree.last_path()?;
        let leaf_kind = tree.profile().leaf;
        let max_size = tree.options().max_block_size;
        while remaining > 0 {
            let leaf = path.leaf()?.clone();
            let (len, root) = tree.with_layout(&leaf, |hdr, layout| {
                Ok((leaf_bitmap::len(layout)?, hdr.root))
            })?;
            let room = tree.capacity(leaf_kind, root, max_size).saturating_sub(len);
            let chunk = remaining.min(room);
            let must_split = if chunk == 0 {
                true
            } else {
                let growth = tree
                    .with_layout(&leaf, |_, layout| leaf_bitmap::append_growth(layout, chunk))?;
                match tree.prepare_space(&leaf, growth, len + chunk)? {
                    Prepared::Ready(()) => {
                        tree.make_mutable(&mut path, 0)?;
                        let leaf = path.leaf()?.clone();
                        tree.update_layout(&leaf, |_, layout| {
                            leaf_bitmap::append(layout, chunk, value)
                        })?;
                        tree.update_path(&mut path, 0)?;
                        remaining -= chunk;
                        false
                    }
                    Prepared::NeedsSpace { extra } => match tree.upsize(&mut path, 0, extra) {
                        Ok(_) => false,
                        Err(TreeError::OutOfSpace { .. }) => true,
                        Err(err) => return Err(err),
                    },
                    Prepared::Full => true,
                }
            };
            if must_split {
                if len == 0 {
                    return Err(TreeError::invariant("empty bitmap leaf cannot take any bits"));
                }
                let right = tree.split_node(&mut path, 0, len)?;
                tree.follow_right(&mut path, 0, right)?;
            }
        }
        Ok(())
    }

    /// Set bits in `0..pos`.
    pub fn rank(&self, pos: u64) -> Result<u64> {
        let (ones, len) = self.totals()?;
        if pos >= len {
            return Ok(ones);
        }
        let (path, local, before) = self.locate(pos)?;
        let in_leaf = self
            .tree
            .with_layout(path.leaf()?, |_, layout| leaf_bitmap::rank(layout, local))?;
        Ok(before + in_leaf)
    }

    /// Position of the set bit with rank `k`, counting from zero.
    pub fn select(&self, k: u64) -> Result<Option<u64>> {
        if k >= self.count_ones()? {
            return Ok(None);
        }
        let mut rest = k;
        let mut base = 0u64;
        let path = self.tree.descend_path(|layout| {
            for idx in 0..branch::len(layout) {
                let entry = branch::entry(layout, idx)?;
                if rest < entry.key {
                    return Ok(idx);
                }
                rest -= entry.key;
                base += entry.size;
            }
            Err(TreeError::invariant("set-bit counts disagree with the root"))
        })?;
        let found = self
            .tree
            .with_layout(path.leaf()?, |_, layout| leaf_bitmap::select(layout, rest))?;
        Ok(found.map(|local| base + local as u64))
    }

    /// Sets the first clear bit and returns its position, appending a bit
    /// when every bit is set.
    pub fn allocate(&mut self) -> Result<u64> {
        let (ones, len) = self.totals()?;
        if ones == len {
            self.append(1, true)?;
            return Ok(len);
        }
        let mut base = 0u64;
        let path = self.tree.descend_path(|layout| {
            for idx in 0..branch::len(layout) {
                let entry = branch::entry(layout, idx)?;
                if entry.key < entry.size {
                    return Ok(idx);
                }
                base += entry.size;
            }
            Err(TreeError::invariant("set-bit counts disagree with the root"))
        })?;
        let local = self
            .tree
            .with_layout(path.leaf()?, |_, layout| leaf_bitmap::first_zero(layout, 0))?
            .ok_or_else(|| TreeError::invariant("leaf with clear bits has none"))?;
        let pos = base + local as u64;
        self.set(pos, true)?;
        tracing::trace!(target: "cowtree::stats", pos, "allocated bit");
        Ok(pos)
    }

    /// Clears bit `pos` and returns whether it was set.
    pub fn free(&mut self, pos: u64) -> Result<bool> {
        self.set(pos, false)
    }
}
