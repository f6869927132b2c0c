//! Copy-on-write for path levels and sibling navigation.
//!
//! Every write to a node goes through [`PathRepair::make_mutable`] or
//! [`PathRepair::clone_prefix`] first. A node whose block is referenced more
//! than once is copied; the copy takes a reference to each of its children,
//! the parent (already exclusive) is pointed at the copy and the original
//! loses one reference. Nodes already exclusive are written in place.

use crate::storage::node::branch;
use crate::types::{Result, TreeError};

use super::ctr::{Edge, Tree};
use super::path::TreePath;

/// Path-level copy-on-write and traversal.
pub trait PathRepair {
    /// Makes `path[level]` and every level above it exclusive, top first.
    fn make_mutable(&mut self, path: &mut TreePath, level: usize) -> Result<()>;

    /// Makes levels `0..=up_to` exclusive, cloning shared nodes and leaving
    /// exclusive ones untouched. Levels above `up_to` are made exclusive too
    /// so the clones can be linked in.
    fn clone_prefix(&mut self, path: &mut TreePath, up_to: usize) -> Result<()>;

    /// Checks child pointers, levels and root flags along the path.
    fn check_path(&self, path: &TreePath) -> Result<()>;

    /// Moves `path[level]` to its right neighbour on the same level, possibly
    /// under another parent. Lower levels follow first children. Returns
    /// false at the right edge of the tree.
    fn next_node(&self, path: &mut TreePath, level: usize) -> Result<bool>;

    /// Mirror of [`next_node`](Self::next_node); lower levels follow last
    /// children.
    fn prev_node(&self, path: &mut TreePath, level: usize) -> Result<bool>;
}

impl Tree {
    /// Clones `path[level]` when shared. The level above must already be
    /// exclusive.
    fn cow_level(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        let old = path.node(level)?.clone();
        if !self.store.is_shared(old.id())? {
            return Ok(());
        }
        let top = path.top()?;
        if level == top && old.id() != self.root {
            return Err(TreeError::invariant(format!(
                "shared block {} at the top of a path that does not start at the root",
                old.id()
            )));
        }
        let copy = self.store.clone_block(old.id())?;
        for child in self.children(&copy)? {
            self.store.ref_block(child)?;
        }
        if level == top {
            self.root = copy.id();
        } else {
            let parent = path.node(level + 1)?.clone();
            let idx = path.parent_idx(level)?;
            self.update_layout(&parent, |_, layout| branch::set_child(layout, idx, copy.id()))?;
        }
        self.release_block(old.id())?;
        self.stats.inc_clones();
        tracing::trace!(
            target: "cowtree::cow",
            level,
            from = old.id().0,
            to = copy.id().0,
            "cloned shared node"
        );
        path.set_node(level, copy)
    }
}

impl PathRepair for Tree {
    fn make_mutable(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        let top = path.top()?;
        if level > top {
            return Err(TreeError::invariant(format!(
                "make_mutable level {level} above path top {top}"
            )));
        }
        for l in (level..=top).rev() {
            self.cow_level(path, l)?;
        }
        Ok(())
    }

    fn clone_prefix(&mut self, path: &mut TreePath, up_to: usize) -> Result<()> {
        self.make_mutable(path, up_to)?;
        for l in (0..up_to).rev() {
            self.cow_level(path, l)?;
        }
        Ok(())
    }

    fn check_path(&self, path: &TreePath) -> Result<()> {
        let top = path.top()?;
        if path.parent_idx(top)? != 0 {
            return Err(TreeError::invariant("path top has a parent index"));
        }
        let top_hdr = self.header(path.node(top)?)?;
        if top_hdr.root != (path.id(top)? == self.root) {
            return Err(TreeError::invariant(format!(
                "root flag of block {} disagrees with the tree root",
                path.id(top)?
            )));
        }
        for l in 0..top {
            let node = path.node(l)?;
            let parent = path.node(l + 1)?;
            let hdr = self.header(node)?;
            let parent_hdr = self.header(parent)?;
            if hdr.root {
                return Err(TreeError::invariant(format!(
                    "root flag set below the top at level {l}"
                )));
            }
            if parent_hdr.leaf || hdr.level + 1 != parent_hdr.level {
                return Err(TreeError::invariant(format!(
                    "level {} under level {} at path level {l}",
                    hdr.level, parent_hdr.level
                )));
            }
            let idx = path.parent_idx(l)?;
            let child = self.child(parent, idx)?;
            if child != node.id() {
                return Err(TreeError::invariant(format!(
                    "parent {} slot {idx} holds {child}, path has {}",
                    parent.id(),
                    node.id()
                )));
            }
        }
        Ok(())
    }

    fn next_node(&self, path: &mut TreePath, level: usize) -> Result<bool> {
        let top = path.top()?;
        for l in level..top {
            let parent = path.node(l + 1)?.clone();
            let idx = path.parent_idx(l)?;
            if idx + 1 < self.node_size(&parent)? {
                let sibling = self.load(self.child(&parent, idx + 1)?)?;
                path.set(l, sibling, idx + 1)?;
                self.refill_below(path, l, Edge::First)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn prev_node(&self, path: &mut TreePath, level: usize) -> Result<bool> {
        let top = path.top()?;
        for l in level..top {
            let parent = path.node(l + 1)?.clone();
            let idx = path.parent_idx(l)?;
            if idx > 0 {
                let sibling = self.load(self.child(&parent, idx - 1)?)?;
                path.set(l, sibling, idx - 1)?;
                self.refill_below(path, l, Edge::Last)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}
