//! Structural mutations: child insertion, splits, merges, root promotion and
//! demotion, node and range removal and summary propagation.
//!
//! Every mutation follows the same sequence. The change is measured first
//! ([`Tree::prepare_space`]); shared nodes on the path are cloned; the block
//! grows when the change fits at a larger size, or the node splits when it
//! does not fit at any allowed size; then the change is committed and the new
//! summaries are pushed towards the root.

use crate::primitives::store::BlockHandle;
use crate::storage::node::branch;
use crate::storage::node::{MergeFrom, MergeGrowth, RemoveUnits, SplitTo, Summary};
use crate::storage::packed::Prepared;
use crate::types::{BlockId, Result, TreeError};

use super::cow::PathRepair;
use super::ctr::{Edge, Tree};
use super::lifecycle::NodeSizing;
use super::path::TreePath;

/// Tree-shape changes driven through a [`TreePath`].
pub trait StructuralMutation {
    /// Inserts `child` with `summary` at `idx` of the branch `path[level]`,
    /// growing the branch when needed. Fails with `OutOfSpace` when the
    /// branch cannot take another child at any allowed size.
    fn insert_child(
        &mut self,
        path: &mut TreePath,
        level: usize,
        idx: usize,
        child: BlockId,
        summary: Summary,
    ) -> Result<()>;

    /// Inserts `children` before `idx` of the branch `path[level]` in one
    /// write. Each child brings one reference. Fails with `OutOfSpace` when
    /// the branch cannot take all of them at any allowed size.
    fn insert_children(
        &mut self,
        path: &mut TreePath,
        level: usize,
        idx: usize,
        children: &[(BlockId, Summary)],
    ) -> Result<()>;

    /// Pushes the summaries of `path[level..]` up to the root.
    fn update_path(&mut self, path: &mut TreePath, level: usize) -> Result<()>;

    /// Moves units `split_at..` of `path[level]` into a new right sibling and
    /// returns it. The path keeps pointing at the left node unless the level
    /// below moved right with the split.
    fn split_node(
        &mut self,
        path: &mut TreePath,
        level: usize,
        split_at: usize,
    ) -> Result<BlockHandle>;

    /// Adds a new root one level above the current one.
    fn promote_root(&mut self, path: &mut TreePath) -> Result<()>;

    /// Replaces single-child roots by their child while the child can hold
    /// the root segments. Returns true when the height changed.
    fn remove_redundant_root(&mut self, path: &mut TreePath) -> Result<bool>;

    /// Absorbs the right sibling of `path[level]` into it.
    fn merge_with_right(&mut self, path: &mut TreePath, level: usize) -> Result<bool>;

    /// Absorbs `path[level]` into its left sibling and moves the path there.
    fn merge_with_left(&mut self, path: &mut TreePath, level: usize) -> Result<bool>;

    /// Merges an underfilled `path[level]` with a sibling and continues with
    /// the parent.
    fn rebalance(&mut self, path: &mut TreePath, level: usize) -> Result<()>;

    /// Unlinks the empty node `path[level]` from its parent, taking parents
    /// that would become empty with it. The path moves to the next node, or
    /// the previous one at the right edge.
    fn remove_node(&mut self, path: &mut TreePath, level: usize) -> Result<bool>;

    /// Removes every unit from `from` in leaf `start[0]` up to `to` in leaf
    /// `stop[0]`, exclusive. Subtrees between the two leaves are unlinked and
    /// released whole, the edge leaves are trimmed and both boundaries are
    /// rebalanced. Returns the number of units removed.
    ///
    /// Both paths must run from the root to a leaf. On return they point at
    /// the leaf now holding the first unit after the range, or at the last
    /// leaf when the range reached the end.
    fn remove_range(
        &mut self,
        start: &mut TreePath,
        from: usize,
        stop: &mut TreePath,
        to: usize,
    ) -> Result<u64>;
}

impl Tree {
    /// Decides whether `growth` more bytes and `new_units` units fit into
    /// `node` now, after growing it, or not at all.
    pub(crate) fn prepare_space(
        &self,
        node: &BlockHandle,
        growth: usize,
        new_units: usize,
    ) -> Result<Prepared<()>> {
        let (hdr, free) = self.with_layout(node, |hdr, layout| Ok((*hdr, layout.free_space())))?;
        if growth <= free {
            return Ok(Prepared::Ready(()));
        }
        let kind = self.registry.lookup(hdr.type_tag)?.kind;
        let limit = self.capacity(kind, hdr.root, self.options.max_block_size);
        if new_units <= limit && self.can_upsize(node, growth)?.is_some() {
            Ok(Prepared::NeedsSpace { extra: growth })
        } else {
            Ok(Prepared::Full)
        }
    }

    fn split_parent(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        let parent = path.node(level + 1)?.clone();
        let size = self.node_size(&parent)?;
        if size < 2 {
            return Err(TreeError::invariant(format!(
                "parent {} of level {level} is full with {size} children",
                parent.id()
            )));
        }
        self.split_node(path, level + 1, size / 2)?;
        Ok(())
    }

    fn ensure_parent_room(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        loop {
            let parent = path.node(level + 1)?.clone();
            let growth = self.with_layout(&parent, |_, layout| Ok(branch::insert_growth(layout, 1)))?;
            let units = self.node_size(&parent)? + 1;
            match self.prepare_space(&parent, growth, units)? {
                Prepared::Ready(()) => return Ok(()),
                Prepared::NeedsSpace { extra } => match self.upsize(path, level + 1, extra) {
                    Ok(_) => return Ok(()),
                    Err(TreeError::OutOfSpace { .. }) => self.split_parent(path, level)?,
                    Err(err) => return Err(err),
                },
                Prepared::Full => self.split_parent(path, level)?,
            }
        }
    }

    fn merge_feasible(&self, left: &BlockHandle, right: &BlockHandle) -> Result<Option<usize>> {
        let kind = self.node_kind(left)?;
        let units = self.node_size(left)? + self.node_size(right)?;
        if units > self.capacity(kind, false, self.options.max_block_size) {
            return Ok(None);
        }
        let growth = {
            let src = right.read();
            self.registry.dispatch(&left.read(), MergeGrowth { src: &src })?
        };
        Ok(self.can_upsize(left, growth)?.map(|_| growth))
    }

    /// Appends `right`, the sibling after `path[level]`, to `path[level]`.
    fn merge_into(
        &mut self,
        path: &mut TreePath,
        level: usize,
        right: BlockHandle,
        growth: usize,
    ) -> Result<()> {
        self.make_mutable(path, level)?;
        if growth > 0 {
            self.upsize(path, level, growth)?;
        }
        let left = path.node(level)?.clone();
        self.ensure_exclusive(left.id())?;
        {
            let src = right.read();
            let mut dst = left.write();
            self.registry.dispatch_pair(&mut dst, &src, MergeFrom)?;
        }
        for child in self.children(&right)? {
            self.store.ref_block(child)?;
        }
        let left_sum = self.node_summary(&left)?;
        let parent = path.node(level + 1)?.clone();
        let pidx = path.parent_idx(level)?;
        self.update_layout(&parent, |_, layout| {
            branch::remove_children(layout, pidx + 1, pidx + 2)?;
            branch::set_entry(layout, pidx, left_sum)
        })?;
        self.release_block(right.id())?;
        self.stats.inc_merges();
        tracing::trace!(
            target: "cowtree::merge",
            level,
            left = left.id().0,
            right = right.id().0,
            units = left_sum.size,
            "merged siblings"
        );
        self.update_path(path, level + 1)
    }
}

impl Tree {
    /// Drops units `start..end` of an exclusive node.
    fn trim_node(&self, node: &BlockHandle, start: usize, end: usize) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        self.update_block(node, |block| {
            self.registry.dispatch_mut(block, RemoveUnits { start, end })
        })
    }

    /// Unlinks children `start..end` of an exclusive branch and drops their
    /// references.
    fn drop_children(&self, node: &BlockHandle, start: usize, end: usize) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let victims = self.with_layout(node, |_, layout| {
            branch::child_ids(layout)
                .get(start..end)
                .map(<[BlockId]>::to_vec)
                .ok_or_else(|| {
                    TreeError::invariant(format!("dropping children {start}..{end} out of range"))
                })
        })?;
        self.update_layout(node, |_, layout| branch::remove_children(layout, start, end))?;
        for id in victims {
            self.release_block(id)?;
        }
        Ok(())
    }

    /// Rewrites every parent entry along `path` from `level` up. Unlike
    /// [`StructuralMutation::update_path`] it does not stop at the first
    /// entry that is already current.
    fn refresh_path(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        for l in level..path.top()? {
            let summary = self.node_summary(path.node(l)?)?;
            let idx = path.parent_idx(l)?;
            self.make_mutable(path, l + 1)?;
            let parent = path.node(l + 1)?.clone();
            self.update_layout(&parent, |_, layout| branch::set_entry(layout, idx, summary))?;
        }
        Ok(())
    }

    /// Shrinks and rebalances every level of `path`, lowest first.
    fn rebalance_levels(&mut self, path: &mut TreePath) -> Result<()> {
        let mut level = 0;
        while level < path.top()? {
            self.downsize(path, level)?;
            self.rebalance(path, level)?;
            level += 1;
        }
        self.remove_redundant_root(path)?;
        Ok(())
    }

    /// Path to the leaf holding unit `pos`, or to the last leaf when `pos`
    /// is at or past the end.
    fn boundary_path(&self, pos: u64) -> Result<TreePath> {
        let total = self.node_summary(&self.load(self.root)?)?.size;
        if pos < total {
            Ok(self.position_path(pos)?.0)
        } else {
            self.last_path()
        }
    }
}

impl StructuralMutation for Tree {
    fn insert_child(
        &mut self,
        path: &mut TreePath,
        level: usize,
        idx: usize,
        child: BlockId,
        summary: Summary,
    ) -> Result<()> {
        self.insert_children(path, level, idx, &[(child, summary)])
    }

    fn insert_children(
        &mut self,
        path: &mut TreePath,
        level: usize,
        idx: usize,
        children: &[(BlockId, Summary)],
    ) -> Result<()> {
        if children.is_empty() {
            return Ok(());
        }
        let count = children.len();
        let node = path.node(level)?.clone();
        let (growth, free) = self.with_layout(&node, |hdr, layout| {
            if hdr.leaf {
                return Err(TreeError::invariant("inserting a child into a leaf"));
            }
            Ok((branch::insert_growth(layout, count), layout.free_space()))
        })?;
        let units = self.node_size(&node)? + count;
        match self.prepare_space(&node, growth, units)? {
            Prepared::Ready(()) => {}
            Prepared::NeedsSpace { extra } => {
                self.upsize(path, level, extra)?;
            }
            Prepared::Full => {
                return Err(TreeError::OutOfSpace {
                    needed: growth,
                    available: free,
                })
            }
        }
        self.make_mutable(path, level)?;
        let node = path.node(level)?.clone();
        self.update_layout(&node, |_, layout| branch::insert_children(layout, idx, children))?;
        if level > 0 {
            path.move_right(level - 1, idx, count)?;
        }
        if count > 1 {
            tracing::trace!(
                target: "cowtree::split",
                level,
                block = node.id().0,
                idx,
                count,
                "linked children"
            );
        }
        self.update_path(path, level)
    }

    fn update_path(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        let top = path.top()?;
        for l in level..top {
            let summary = self.node_summary(path.node(l)?)?;
            let idx = path.parent_idx(l)?;
            let stored =
                self.with_layout(path.node(l + 1)?, |_, layout| branch::entry(layout, idx))?;
            if stored == summary {
                break;
            }
            self.make_mutable(path, l + 1)?;
            let parent = path.node(l + 1)?.clone();
            self.update_layout(&parent, |_, layout| branch::set_entry(layout, idx, summary))?;
        }
        Ok(())
    }

    fn split_node(
        &mut self,
        path: &mut TreePath,
        level: usize,
        split_at: usize,
    ) -> Result<BlockHandle> {
        self.make_mutable(path, level)?;
        if level == path.top()? {
            self.promote_root(path)?;
        }
        self.ensure_parent_room(path, level)?;

        let node = path.node(level)?.clone();
        let hdr = self.header(&node)?;
        let units = self.node_size(&node)?;
        if split_at > units {
            return Err(TreeError::Invalid("split point past the end of the node"));
        }
        let right = self.create_non_root_node(hdr.level, hdr.leaf, Some(hdr.block_size as usize))?;
        let moved = {
            let mut src = node.write();
            let mut dst = right.write();
            self.registry
                .dispatch_pair_mut(&mut src, &mut dst, SplitTo { at: split_at })
        };
        if let Err(err) = moved {
            self.store.free_block(right.id())?;
            return Err(err);
        }

        let left_sum = self.node_summary(&node)?;
        let right_sum = self.node_summary(&right)?;
        let pidx = path.parent_idx(level)?;
        let parent = path.node(level + 1)?.clone();
        self.update_layout(&parent, |_, layout| {
            branch::set_entry(layout, pidx, left_sum)?;
            branch::insert_child(layout, pidx + 1, right.id(), right_sum)
        })?;

        if level > 0 {
            let below = path.parent_idx(level - 1)?;
            if below >= split_at {
                path.set(level, right.clone(), pidx + 1)?;
                path.set_parent_idx(level - 1, below - split_at)?;
            }
        }
        self.update_path(path, level + 1)?;
        self.stats.inc_splits();
        tracing::trace!(
            target: "cowtree::split",
            level,
            left = node.id().0,
            right = right.id().0,
            split_at,
            units,
            "split node"
        );
        Ok(right)
    }

    fn promote_root(&mut self, path: &mut TreePath) -> Result<()> {
        let top = path.top()?;
        self.make_mutable(path, top)?;
        let old = path.node(top)?.clone();
        if old.id() != self.root {
            return Err(TreeError::invariant("promoting a path that does not start at the root"));
        }
        let hdr = self.header(&old)?;
        let summary = self.node_summary(&old)?;
        let root = self.create_root_node(hdr.level + 1, false, None)?;
        let linked =
            self.update_layout(&root, |_, layout| branch::insert_child(layout, 0, old.id(), summary));
        if let Err(err) = linked {
            self.store.free_block(root.id())?;
            return Err(err);
        }
        self.root_to_node(&old)?;
        self.root = root.id();
        self.stats.inc_root_promotions();
        tracing::debug!(
            target: "cowtree::root",
            old_root = old.id().0,
            new_root = root.id().0,
            level = hdr.level + 1,
            "promoted root"
        );
        path.push_root(root);
        Ok(())
    }

    fn remove_redundant_root(&mut self, path: &mut TreePath) -> Result<bool> {
        let mut changed = false;
        loop {
            let top = path.top()?;
            if top == 0 || self.node_size(path.node(top)?)? != 1 {
                break;
            }
            if !self.can_convert_to_root(path.node(top - 1)?)? {
                break;
            }
            self.make_mutable(path, top - 1)?;
            let child = path.node(top - 1)?.clone();
            let old = path.node(top)?.clone();
            self.node_to_root(&child)?;
            self.root = child.id();
            self.store.free_block(old.id())?;
            path.remove_root()?;
            path.set_parent_idx(top - 1, 0)?;
            self.stats.inc_root_demotions();
            tracing::debug!(
                target: "cowtree::root",
                old_root = old.id().0,
                new_root = child.id().0,
                level = top - 1,
                "demoted root"
            );
            changed = true;
        }
        Ok(changed)
    }

    fn merge_with_right(&mut self, path: &mut TreePath, level: usize) -> Result<bool> {
        if level >= path.top()? {
            return Ok(false);
        }
        let parent = path.node(level + 1)?.clone();
        let pidx = path.parent_idx(level)?;
        if pidx + 1 >= self.node_size(&parent)? {
            return Ok(false);
        }
        let right = self.load(self.child(&parent, pidx + 1)?)?;
        let left = path.node(level)?.clone();
        match self.merge_feasible(&left, &right)? {
            None => Ok(false),
            Some(growth) => {
                self.merge_into(path, level, right, growth)?;
                Ok(true)
            }
        }
    }

    fn merge_with_left(&mut self, path: &mut TreePath, level: usize) -> Result<bool> {
        if level >= path.top()? {
            return Ok(false);
        }
        let pidx = path.parent_idx(level)?;
        if pidx == 0 {
            return Ok(false);
        }
        let parent = path.node(level + 1)?.clone();
        let left = self.load(self.child(&parent, pidx - 1)?)?;
        let node = path.node(level)?.clone();
        let Some(growth) = self.merge_feasible(&left, &node)? else {
            return Ok(false);
        };
        let left_units = self.node_size(&left)?;
        path.set(level, left, pidx - 1)?;
        if level > 0 {
            let below = path.parent_idx(level - 1)?;
            path.set_parent_idx(level - 1, below + left_units)?;
        }
        self.merge_into(path, level, node, growth)?;
        Ok(true)
    }

    fn rebalance(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        if level >= path.top()? {
            self.remove_redundant_root(path)?;
            return Ok(());
        }
        let node = path.node(level)?.clone();
        let units = self.node_size(&node)?;
        if units == 0 {
            self.remove_node(path, level)?;
            self.remove_redundant_root(path)?;
            return Ok(());
        }
        let hdr = self.header(&node)?;
        let kind = self.registry.lookup(hdr.type_tag)?.kind;
        let capacity = self.capacity(kind, false, hdr.block_size as usize);
        let threshold = capacity * self.options.merge_threshold_pct as usize;
        if units * 100 < threshold
            && (self.merge_with_left(path, level)? || self.merge_with_right(path, level)?)
        {
            return self.rebalance(path, level + 1);
        }
        self.remove_redundant_root(path)?;
        Ok(())
    }

    fn remove_node(&mut self, path: &mut TreePath, level: usize) -> Result<bool> {
        let top = path.top()?;
        if level >= top {
            return Ok(false);
        }
        let mut h = level;
        while h + 1 < top && self.node_size(path.node(h + 1)?)? == 1 {
            h += 1;
        }
        if self.node_size(path.node(h + 1)?)? == 1 {
            return Ok(false);
        }
        self.make_mutable(path, h + 1)?;
        let parent = path.node(h + 1)?.clone();
        let pidx = path.parent_idx(h)?;
        let victim = path.id(h)?;
        self.update_layout(&parent, |_, layout| {
            branch::remove_children(layout, pidx, pidx + 1)
        })?;
        self.release_block(victim)?;
        tracing::trace!(
            target: "cowtree::merge",
            level = h,
            block = victim.0,
            "removed empty node"
        );

        let remaining = self.node_size(&parent)?;
        let (idx, edge) = if pidx < remaining {
            (pidx, Edge::First)
        } else {
            (remaining - 1, Edge::Last)
        };
        let next = self.load(self.child(&parent, idx)?)?;
        path.set(h, next, idx)?;
        self.refill_below(path, h, edge)?;
        self.update_path(path, h + 1)?;
        Ok(true)
    }

    fn remove_range(
        &mut self,
        start: &mut TreePath,
        from: usize,
        stop: &mut TreePath,
        to: usize,
    ) -> Result<u64> {
        let top = start.top()?;
        if stop.top()? != top || start.id(top)? != self.root || stop.id(top)? != self.root {
            return Err(TreeError::Invalid("range paths must start at the tree root"));
        }
        if !self.header(start.node(0)?)?.leaf || !self.header(stop.node(0)?)?.leaf {
            return Err(TreeError::Invalid("range paths must end at leaves"));
        }
        let start_len = self.node_size(start.node(0)?)?;
        if from > start_len || to > self.node_size(stop.node(0)?)? {
            return Err(TreeError::Invalid("range index past the end of its leaf"));
        }
        let first = self.units_before(start, from)?;
        let last = self.units_before(stop, to)?;
        if last < first {
            return Err(TreeError::Invalid("range stop precedes its start"));
        }
        if last == first {
            return Ok(0);
        }

        let mut lca = 0;
        while start.id(lca)? != stop.id(lca)? {
            lca += 1;
        }
        self.make_mutable(start, 0)?;
        for level in lca..=top {
            stop.set_node(level, start.node(level)?.clone())?;
        }
        self.make_mutable(stop, 0)?;

        if lca == 0 {
            self.trim_node(start.node(0)?, from, to)?;
        } else {
            let a = start.parent_idx(lca - 1)?;
            let b = stop.parent_idx(lca - 1)?;
            self.drop_children(start.node(lca)?, a + 1, b)?;
            stop.move_left(lca - 1, a + 1, b - a - 1)?;
            for level in (1..lca).rev() {
                let left = start.node(level)?.clone();
                let left_len = self.node_size(&left)?;
                self.drop_children(&left, start.parent_idx(level - 1)? + 1, left_len)?;
                let cut = stop.parent_idx(level - 1)?;
                self.drop_children(stop.node(level)?, 0, cut)?;
                stop.move_left(level - 1, 0, cut)?;
            }
            self.trim_node(start.node(0)?, from, start_len)?;
            self.trim_node(stop.node(0)?, 0, to)?;
            self.refresh_path(stop, 0)?;
        }
        self.refresh_path(start, 0)?;

        if lca > 0 && self.node_size(stop.node(0)?)? == 0 {
            self.remove_node(stop, 0)?;
        }
        if self.node_size(start.node(0)?)? == 0 {
            self.remove_node(start, 0)?;
        }
        if first > 0 {
            let mut left = self.position_path(first - 1)?.0;
            self.rebalance_levels(&mut left)?;
        }
        let mut right = self.boundary_path(first)?;
        self.rebalance_levels(&mut right)?;

        let path = self.boundary_path(first)?;
        *start = path.clone();
        *stop = path;
        let removed = last - first;
        tracing::debug!(
            target: "cowtree::merge",
            first,
            removed,
            "removed unit range"
        );
        Ok(removed)
    }
}
