use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::primitives::store::BlockStore;
use crate::storage::btree::{
    ContainerProfile, NodeSizing, PathRepair, StructuralMutation, Tree, TreeOptions, TreePath,
};
use crate::storage::node::{branch, leaf_map, Registry, Summary};
use crate::storage::packed::Prepared;
use crate::types::{BlockId, CtrId, Result, TreeError};

/// Ordered `u64 -> u64` map stored in a copy-on-write tree.
///
/// Leaves hold sorted key/value arrays; branches route by the largest key
/// below each child. Forks are O(1) and stay isolated under writes.
pub struct CowMap {
    tree: Tree,
}

impl CowMap {
    /// Creates an empty map with default options.
    pub fn create(store: Arc<dyn BlockStore>, name: CtrId) -> Result<Self> {
        Self::create_with(
            store,
            Arc::new(Registry::standard()),
            TreeOptions::default(),
            name,
        )
    }

    /// Creates an empty map.
    pub fn create_with(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        name: CtrId,
    ) -> Result<Self> {
        let tree = Tree::create(store, registry, options, name, ContainerProfile::MAP)?;
        Ok(Self { tree })
    }

    /// Opens the map rooted at `root`.
    pub fn open(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        root: BlockId,
    ) -> Result<Self> {
        let tree = Tree::open(store, registry, options, root)?;
        if tree.profile() != ContainerProfile::MAP {
            tree.release()?;
            return Err(TreeError::Invalid("root does not belong to a map"));
        }
        Ok(Self { tree })
    }

    /// Returns an isolated snapshot sharing every block with this map.
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

    fn path_to(&self, key: u64) -> Result<TreePath> {
        self.tree.descend_path(|layout| branch::find_key(layout, key))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: u64) -> Result<Option<u64>> {
        let path = self.path_to(key)?;
        self.tree.with_layout(path.leaf()?, |_, layout| {
            Ok(leaf_map::find(layout, key)
                .ok()
                .and_then(|idx| leaf_map::entry(layout, idx))
                .map(|(_, value)| value))
        })
    }

    /// Stores `value` under `key` and returns the previous value.
    pub fn insert(&mut self, key: u64, value: u64) -> Result<Option<u64>> {
        let mut path = self.path_to(key)?;
        let tree = &mut self.tree;
        loop {
            let leaf = path.leaf()?.clone();
            let (found, growth, len) = tree.with_layout(&leaf, |_, layout| {
                Ok((
                    leaf_map::find(layout, key),
                    leaf_map::insert_growth(layout),
                    leaf_map::len(layout),
                ))
            })?;
            let idx = match found {
                Ok(idx) => {
                    tree.make_mutable(&mut path, 0)?;
                    let leaf = path.leaf()?.clone();
                    let old =
                        tree.update_layout(&leaf, |_, layout| leaf_map::set_value(layout, idx, value))?;
                    return Ok(Some(old));
                }
                Err(idx) => idx,
            };
            let must_split = match tree.prepare_space(&leaf, growth, len + 1)? {
                Prepared::Ready(()) => {
                    tree.make_mutable(&mut path, 0)?;
                    let leaf = path.leaf()?.clone();
                    tree.update_layout(&leaf, |_, layout| leaf_map::insert(layout, idx, key, value))?;
                    tree.update_path(&mut path, 0)?;
                    return Ok(None);
                }
                Prepared::NeedsSpace { extra } => match tree.upsize(&mut path, 0, extra) {
                    Ok(_) => false,
                    Err(TreeError::OutOfSpace { .. }) => true,
                    Err(err) => return Err(err),
                },
                Prepared::Full => true,
            };
            if must_split {
                if len < 2 {
                    return Err(TreeError::OutOfSpace {
                        needed: growth,
                        available: 0,
                    });
                }
                let at = (len / 2).max(1);
                let right = tree.split_node(&mut path, 0, at)?;
                if idx > at {
                    tree.follow_right(&mut path, 0, right)?;
                }
            }
        }
    }

    /// Removes `key` and returns its value.
    pub fn remove(&mut self, key: u64) -> Result<Option<u64>> {
        let mut path = self.path_to(key)?;
        let found = self
            .tree
            .with_layout(path.leaf()?, |_, layout| Ok(leaf_map::find(layout, key)))?;
        let Ok(idx) = found else {
            return Ok(None);
        };
        let tree = &mut self.tree;
        tree.make_mutable(&mut path, 0)?;
        let leaf = path.leaf()?.clone();
        let (_, old) = tree.update_layout(&leaf, |_, layout| leaf_map::remove(layout, idx))?;
        tree.update_path(&mut path, 0)?;
        tree.downsize(&mut path, 0)?;
        tree.rebalance(&mut path, 0)?;
        Ok(Some(old))
    }

    /// Removes every entry with a key inside `range` and returns how many
    /// were removed.
    pub fn remove_range(&mut self, range: impl RangeBounds<u64>) -> Result<u64> {
        let (mut start, from) = self.boundary(range.start_bound(), false)?;
        let (mut stop, to) = self.boundary(range.end_bound(), true)?;
        if self.tree.units_before(&stop, to)? <= self.tree.units_before(&start, from)? {
            return Ok(0);
        }
        self.tree.remove_range(&mut start, from, &mut stop, to)
    }

    /// Leaf path and entry index where a range bound falls. `at_end` selects
    /// the index one past the bound for an included end.
    fn boundary(&self, bound: Bound<&u64>, at_end: bool) -> Result<(TreePath, usize)> {
        let key = match bound {
            Bound::Unbounded if at_end => {
                let path = self.tree.last_path()?;
                let len = self.tree.node_size(path.leaf()?)?;
                return Ok((path, len));
            }
            Bound::Unbounded => return Ok((self.tree.root_path()?, 0)),
            Bound::Included(key) | Bound::Excluded(key) => *key,
        };
        let path = self.path_to(key)?;
        let found = self
            .tree
            .with_layout(path.leaf()?, |_, layout| Ok(leaf_map::find(layout, key)))?;
        let past_key = matches!(
            (bound, at_end),
            (Bound::Excluded(_), false) | (Bound::Included(_), true)
        );
        let idx = match found {
            Ok(idx) if past_key => idx + 1,
            Ok(idx) | Err(idx) => idx,
        };
        Ok((path, idx))
    }

    /// Stores every entry, later duplicates winning, and returns how many
    /// keys were new.
    ///
    /// Entries routed to the same leaf are merged into it with one write.
    /// What does not fit goes to fresh right siblings, which are linked to
    /// the parent together.
    pub fn insert_batch(&mut self, entries: impl IntoIterator<Item = (u64, u64)>) -> Result<u64> {
        let pending: Vec<(u64, u64)> = entries
            .into_iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .collect();
        let mut added = 0u64;
        let mut next = 0;
        while next < pending.len() {
            let mut path = self.path_to(pending[next].0)?;
            let (existing, last_key) = self.tree.with_layout(path.leaf()?, |_, layout| {
                Ok((leaf_map::entries(layout), leaf_map::last(layout).map(|(key, _)| key)))
            })?;
            let end = match (last_key, self.is_last_leaf(&path)?) {
                (_, true) => pending.len(),
                (Some(bound), false) => {
                    next + pending[next..].partition_point(|(key, _)| *key <= bound)
                }
                (None, false) => next + 1,
            }
            .max(next + 1);
            let (merged, fresh) = merge_entries(&existing, &pending[next..end]);
            Self::write_leaf_run(&mut self.tree, &mut path, &merged)?;
            added += fresh;
            next = end;
        }
        Ok(added)
    }

    fn is_last_leaf(&self, path: &TreePath) -> Result<bool> {
        for level in 0..path.top()? {
            let siblings = self.tree.node_size(path.node(level + 1)?)?;
            if path.parent_idx(level)? + 1 != siblings {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replaces the entries of `path[0]` with `run`, spilling into new right
    /// siblings when one leaf cannot hold them.
    fn write_leaf_run(tree: &mut Tree, path: &mut TreePath, run: &[(u64, u64)]) -> Result<()> {
        let leaf_kind = tree.profile().leaf;
        let max = tree.options().max_block_size;
        let mut fit = tree.capacity(leaf_kind, path.top()? == 0, max);
        if run.len() > fit && path.top()? == 0 {
            tree.promote_root(path)?;
            fit = tree.capacity(leaf_kind, false, max);
        }
        if fit == 0 {
            return Err(TreeError::OutOfSpace {
                needed: run.len(),
                available: 0,
            });
        }
        let per_leaf = run.len().div_ceil(run.len().div_ceil(fit)).max(1);
        let mut parts = run.chunks(per_leaf);
        let head = parts.next().unwrap_or(&[]);

        let leaf = path.leaf()?.clone();
        let growth =
            tree.with_layout(&leaf, |_, layout| Ok(leaf_map::assign_growth(layout, head.len())))?;
        match tree.prepare_space(&leaf, growth, head.len())? {
            Prepared::Ready(()) => {}
            Prepared::NeedsSpace { extra } => {
                tree.upsize(path, 0, extra)?;
            }
            Prepared::Full => {
                return Err(TreeError::OutOfSpace {
                    needed: growth,
                    available: 0,
                })
            }
        }
        tree.make_mutable(path, 0)?;
        let leaf = path.leaf()?.clone();
        tree.update_layout(&leaf, |_, layout| leaf_map::assign(layout, head))?;
        tree.update_path(path, 0)?;

        let rest: Vec<&[(u64, u64)]> = parts.collect();
        let branch_kind = tree.profile().branch;
        let mut linked_parts = 0;
        while linked_parts < rest.len() {
            let parent = path.node(1)?.clone();
            let size = tree.node_size(&parent)?;
            let root = tree.header(&parent)?.root;
            let room = tree.capacity(branch_kind, root, max).saturating_sub(size);
            if room == 0 {
                if size < 2 {
                    return Err(TreeError::OutOfSpace {
                        needed: 1,
                        available: 0,
                    });
                }
                tree.split_node(path, 1, size / 2)?;
                continue;
            }
            let group = &rest[linked_parts..(linked_parts + room).min(rest.len())];
            let mut children = Vec::with_capacity(group.len());
            for part in group {
                match Self::new_leaf(tree, part) {
                    Ok(child) => children.push(child),
                    Err(err) => {
                        Self::free_unlinked(tree, &children)?;
                        return Err(err);
                    }
                }
            }
            let pidx = path.parent_idx(0)?;
            if let Err(err) = tree.insert_children(path, 1, pidx + 1, &children) {
                Self::free_unlinked(tree, &children)?;
                return Err(err);
            }
            if let Some((last_id, _)) = children.last() {
                path.set(0, tree.load(*last_id)?, pidx + children.len())?;
            }
            linked_parts += group.len();
        }
        Ok(())
    }

    /// Allocates a leaf holding `part`, sized so the part fits.
    fn new_leaf(tree: &Tree, part: &[(u64, u64)]) -> Result<(BlockId, Summary)> {
        let kind = tree.profile().leaf;
        let max = tree.options().max_block_size;
        let mut size = tree.new_node_size(None)?;
        while tree.capacity(kind, false, size) < part.len() && size < max {
            size = (size * 2).min(max);
        }
        let leaf = tree.create_non_root_node(0, true, Some(size))?;
        let filled = tree
            .update_layout(&leaf, |_, layout| leaf_map::assign(layout, part))
            .and_then(|()| tree.node_summary(&leaf));
        match filled {
            Ok(summary) => Ok((leaf.id(), summary)),
            Err(err) => {
                tree.store().free_block(leaf.id())?;
                Err(err)
            }
        }
    }

    fn free_unlinked(tree: &Tree, children: &[(BlockId, Summary)]) -> Result<()> {
        for (id, _) in children {
            tree.store().free_block(*id)?;
        }
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u64> {
        let root = self.tree.load(self.tree.root())?;
        Ok(self.tree.node_summary(&root)?.size)
    }

    /// Returns true when the map holds no entry.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every entry in key order.
    pub fn entries(&self) -> Result<Vec<(u64, u64)>> {
        self.range(..)
    }

    /// Entries with keys inside `range`, in key order.
    pub fn range(&self, range: impl RangeBounds<u64>) -> Result<Vec<(u64, u64)>> {
        let mut path = match range.start_bound() {
            Bound::Included(start) | Bound::Excluded(start) => self.path_to(*start)?,
            Bound::Unbounded => self.tree.root_path()?,
        };
        let mut out = Vec::new();
        loop {
            let mut past_end = false;
            self.tree.with_layout(path.leaf()?, |_, layout| {
                for (key, value) in leaf_map::entries(layout) {
                    if !range.contains(&key) {
                        past_end |= match range.end_bound() {
                            Bound::Included(end) => key > *end,
                            Bound::Excluded(end) => key >= *end,
                            Bound::Unbounded => false,
                        };
                        continue;
                    }
                    out.push((key, value));
                }
                Ok(())
            })?;
            if past_end || !self.tree.next_node(&mut path, 0)? {
                return Ok(out);
            }
        }
    }

    /// Smallest entry.
    pub fn first(&self) -> Result<Option<(u64, u64)>> {
        let mut path = self.tree.root_path()?;
        loop {
            let found = self
                .tree
                .with_layout(path.leaf()?, |_, layout| Ok(leaf_map::first(layout)))?;
            if found.is_some() || !self.tree.next_node(&mut path, 0)? {
                return Ok(found);
            }
        }
    }

    /// Largest entry.
    pub fn last(&self) -> Result<Option<(u64, u64)>> {
        let mut path = self.tree.last_path()?;
        loop {
            let found = self
                .tree
                .with_layout(path.leaf()?, |_, layout| Ok(leaf_map::last(layout)))?;
            if found.is_some() || !self.tree.prev_node(&mut path, 0)? {
                return Ok(found);
            }
        }
    }
}

/// Merges sorted `existing` entries with sorted `batch` entries, the batch
/// winning on equal keys. Returns the result and how many batch keys were
/// not present before.
fn merge_entries(existing: &[(u64, u64)], batch: &[(u64, u64)]) -> (Vec<(u64, u64)>, u64) {
    let mut out = Vec::with_capacity(existing.len() + batch.len());
    let mut fresh = 0u64;
    let (mut i, mut j) = (0, 0);
    while i < existing.len() && j < batch.len() {
        let (old, new) = (existing[i], batch[j]);
        if old.0 < new.0 {
            out.push(old);
            i += 1;
        } else {
            if old.0 > new.0 {
                fresh += 1;
            } else {
                i += 1;
            }
            out.push(new);
            j += 1;
        }
    }
    fresh += (batch.len() - j) as u64;
    out.extend_from_slice(&existing[i..]);
    out.extend_from_slice(&batch[j..]);
    (out, fresh)
}
