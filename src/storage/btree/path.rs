use smallvec::SmallVec;

use crate::primitives::store::BlockHandle;
use crate::types::{BlockId, Result, TreeError};

/// One level of a [`TreePath`].
#[derive(Clone, Debug)]
pub struct PathEntry {
    /// Node at this level.
    pub node: BlockHandle,
    /// Index of the node in its parent; zero at the top.
    pub parent_idx: usize,
}

/// Nodes from some level of the tree up to the root.
///
/// Indexed by level, so `path[0]` is the lowest node held and the last entry
/// is the highest. For every level below the top,
/// `child(path[l + 1], path[l].parent_idx) == path[l].id()`.
#[derive(Clone, Debug, Default)]
pub struct TreePath {
    entries: SmallVec<[PathEntry; 8]>,
}

impl TreePath {
    /// Creates an empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a path from `(node, parent_idx)` pairs listed from the top
    /// down; the top's parent index is forced to zero.
    pub fn from_top_down(chain: Vec<(BlockHandle, usize)>) -> Self {
        let entries = chain
            .into_iter()
            .enumerate()
            .rev()
            .map(|(depth, (node, parent_idx))| PathEntry {
                node,
                parent_idx: if depth == 0 { 0 } else { parent_idx },
            })
            .collect();
        Self { entries }
    }

    /// Number of levels held.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no level is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest level index.
    pub fn top(&self) -> Result<usize> {
        self.entries
            .len()
            .checked_sub(1)
            .ok_or_else(|| TreeError::invariant("empty tree path"))
    }

    fn entry(&self, level: usize) -> Result<&PathEntry> {
        self.entries.get(level).ok_or_else(|| {
            TreeError::invariant(format!(
                "path level {level} out of range (depth {})",
                self.entries.len()
            ))
        })
    }

    fn entry_mut(&mut self, level: usize) -> Result<&mut PathEntry> {
        let depth = self.entries.len();
        self.entries.get_mut(level).ok_or_else(|| {
            TreeError::invariant(format!("path level {level} out of range (depth {depth})"))
        })
    }

    /// Node handle at `level`.
    pub fn node(&self, level: usize) -> Result<&BlockHandle> {
        Ok(&self.entry(level)?.node)
    }

    /// Block id at `level`.
    pub fn id(&self, level: usize) -> Result<BlockId> {
        Ok(self.entry(level)?.node.id())
    }

    /// Index of the node at `level` in its parent.
    pub fn parent_idx(&self, level: usize) -> Result<usize> {
        Ok(self.entry(level)?.parent_idx)
    }

    /// Replaces the entry at `level`.
    pub fn set(&mut self, level: usize, node: BlockHandle, parent_idx: usize) -> Result<()> {
        *self.entry_mut(level)? = PathEntry { node, parent_idx };
        Ok(())
    }

    /// Replaces the node at `level`, keeping its parent index.
    pub fn set_node(&mut self, level: usize, node: BlockHandle) -> Result<()> {
        self.entry_mut(level)?.node = node;
        Ok(())
    }

    /// Replaces the parent index at `level`.
    pub fn set_parent_idx(&mut self, level: usize, parent_idx: usize) -> Result<()> {
        self.entry_mut(level)?.parent_idx = parent_idx;
        Ok(())
    }

    /// Pushes a new top entry above the current one.
    pub fn push_root(&mut self, node: BlockHandle) {
        self.entries.push(PathEntry {
            node,
            parent_idx: 0,
        });
    }

    /// Drops the top entry.
    pub fn remove_root(&mut self) -> Result<PathEntry> {
        self.entries
            .pop()
            .ok_or_else(|| TreeError::invariant("removing root from an empty path"))
    }

    /// Lowest node held.
    pub fn leaf(&self) -> Result<&BlockHandle> {
        self.node(0)
    }

    /// Highest node held.
    pub fn root(&self) -> Result<&BlockHandle> {
        self.node(self.top()?)
    }

    /// Block ids from the lowest level up.
    pub fn ids(&self) -> SmallVec<[BlockId; 8]> {
        self.entries.iter().map(|entry| entry.node.id()).collect()
    }

    /// Records that `count` children were inserted at `from` in the parent
    /// of `path[level]`.
    pub fn move_right(&mut self, level: usize, from: usize, count: usize) -> Result<()> {
        let entry = self.entry_mut(level)?;
        if entry.parent_idx >= from {
            entry.parent_idx += count;
        }
        Ok(())
    }

    /// Records that children `from..from + count` were removed from the
    /// parent of `path[level]`.
    pub fn move_left(&mut self, level: usize, from: usize, count: usize) -> Result<()> {
        let entry = self.entry_mut(level)?;
        if entry.parent_idx >= from + count {
            entry.parent_idx -= count;
            Ok(())
        } else if entry.parent_idx >= from {
            Err(TreeError::invariant(format!(
                "path level {level} points into removed range {from}..{}",
                from + count
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::store::{BlockStore, MemStore};
    use crate::types::CtrId;

    fn handles(n: usize) -> (MemStore, Vec<BlockHandle>) {
        let store = MemStore::default();
        let handles = (0..n)
            .map(|_| store.create_block(64, CtrId(1)).unwrap())
            .collect();
        (store, handles)
    }

    #[test]
    fn push_and_remove_root_track_depth() {
        let (_store, blocks) = handles(3);
        let mut path = TreePath::new();
        assert!(path.top().is_err());
        path.push_root(blocks[0].clone());
        path.push_root(blocks[1].clone());
        assert_eq!(path.depth(), 2);
        assert_eq!(path.root().unwrap().id(), blocks[1].id());
        assert_eq!(path.leaf().unwrap().id(), blocks[0].id());
        path.set_parent_idx(0, 4).unwrap();
        path.push_root(blocks[2].clone());
        assert_eq!(path.ids().as_slice(), &[blocks[0].id(), blocks[1].id(), blocks[2].id()]);
        assert_eq!(path.remove_root().unwrap().node.id(), blocks[2].id());
        assert_eq!(path.parent_idx(0).unwrap(), 4);
        assert!(path.node(5).is_err());
    }

    #[test]
    fn move_right_shifts_at_or_after_insert_point() {
        let (_store, blocks) = handles(2);
        let mut path = TreePath::new();
        path.push_root(blocks[0].clone());
        path.push_root(blocks[1].clone());
        path.set_parent_idx(0, 3).unwrap();
        path.move_right(0, 4, 2).unwrap();
        assert_eq!(path.parent_idx(0).unwrap(), 3);
        path.move_right(0, 3, 2).unwrap();
        assert_eq!(path.parent_idx(0).unwrap(), 5);
    }

    #[test]
    fn move_left_rejects_removed_target() {
        let (_store, blocks) = handles(2);
        let mut path = TreePath::new();
        path.push_root(blocks[0].clone());
        path.push_root(blocks[1].clone());
        path.set_parent_idx(0, 6).unwrap();
        path.move_left(0, 1, 2).unwrap();
        assert_eq!(path.parent_idx(0).unwrap(), 4);
        path.move_left(0, 5, 3).unwrap();
        assert_eq!(path.parent_idx(0).unwrap(), 4);
        assert!(matches!(
            path.move_left(0, 3, 2),
            Err(TreeError::InvariantViolation(_))
        ));
    }
}
