use std::sync::Arc;

use crate::primitives::store::{BlockHandle, BlockStore};
use crate::storage::node::branch;
use crate::storage::node::{
    open_layout, open_layout_mut, ChildrenOf, ExtData, NodeKind, NodeVisitor, Registry,
    RootMetadata, ShapeTable, SizeOf, Summary, SummaryOf, EXT_DATA, METADATA,
};
use crate::storage::packed::{LayoutMut, LayoutRef};
use crate::types::block::NodeHeader;
use crate::types::{BlockId, CtrId, Result, TreeError};

use super::options::TreeOptions;
use super::path::TreePath;
use super::stats::TreeStats;

/// Branch and leaf variants a container is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerProfile {
    /// Variant of every branch node.
    pub branch: NodeKind,
    /// Variant of every leaf node.
    pub leaf: NodeKind,
}

impl ContainerProfile {
    /// Ordered u64 map.
    pub const MAP: ContainerProfile = ContainerProfile {
        branch: NodeKind::MapBranch,
        leaf: NodeKind::MapLeaf,
    };

    /// Bitmap with rank and select.
    pub const BITMAP: ContainerProfile = ContainerProfile {
        branch: NodeKind::BitmapBranch,
        leaf: NodeKind::BitmapLeaf,
    };

    /// Variant for a node on the leaf level or above it.
    pub fn kind_for(&self, is_leaf: bool) -> NodeKind {
        if is_leaf {
            self.leaf
        } else {
            self.branch
        }
    }

    /// Extension record stored in the root.
    pub fn ext_data(&self) -> ExtData {
        ExtData {
            branch_tag: self.branch.tag(),
            leaf_tag: self.leaf.tag(),
        }
    }

    /// Resolves the profile recorded in a root's extension data.
    pub fn from_ext(registry: &Registry, ext: &ExtData) -> Result<Self> {
        let branch = registry.lookup(ext.branch_tag)?;
        let leaf = registry.lookup(ext.leaf_tag)?;
        if branch.leaf || !leaf.leaf {
            return Err(TreeError::Corruption("extension data names wrong variants"));
        }
        Ok(Self {
            branch: branch.kind,
            leaf: leaf.kind,
        })
    }
}

/// Handle to one copy-on-write tree.
///
/// The handle owns one reference to its root block. Forks share every block
/// with the tree they came from until either side writes; writes clone the
/// shared nodes on the way down and leave the other tree untouched. A handle
/// must be given back with [`Tree::release`] to drop its blocks.
pub struct Tree {
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) shapes: Arc<ShapeTable>,
    pub(crate) options: TreeOptions,
    pub(crate) stats: Arc<TreeStats>,
    pub(crate) root: BlockId,
    pub(crate) name: CtrId,
    pub(crate) profile: ContainerProfile,
}

/// Which child to take when refilling path levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Edge {
    First,
    Last,
}

impl Tree {
    /// Creates an empty tree whose root is a single leaf.
    pub fn create(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        name: CtrId,
        profile: ContainerProfile,
    ) -> Result<Self> {
        options.validate()?;
        let shapes = Arc::new(ShapeTable::build(
            options.min_block_size,
            options.max_block_size,
        ));
        let mut tree = Self {
            store,
            registry,
            shapes,
            options,
            stats: Arc::new(TreeStats::default()),
            root: BlockId::NULL,
            name,
            profile,
        };
        let root = tree.create_root_node(0, true, None)?;
        tree.root = root.id();
        tracing::debug!(
            target: "cowtree::root",
            root = root.id().0,
            name = name.0,
            "created tree"
        );
        Ok(tree)
    }

    /// Opens the tree rooted at `root`, taking a new reference to it.
    pub fn open(
        store: Arc<dyn BlockStore>,
        registry: Arc<Registry>,
        options: TreeOptions,
        root: BlockId,
    ) -> Result<Self> {
        options.validate()?;
        let handle = store.get_block(root)?;
        let (hdr, meta, ext) = {
            let block = handle.read();
            let hdr = NodeHeader::decode(&block)?;
            if !hdr.root {
                return Err(TreeError::Invalid("block is not a tree root"));
            }
            let layout = open_layout(&block)?;
            let meta = RootMetadata::decode(layout.segment(METADATA))?;
            let ext = ExtData::decode(layout.segment(EXT_DATA))?;
            (hdr, meta, ext)
        };
        let profile = ContainerProfile::from_ext(&registry, &ext)?;
        if profile.kind_for(hdr.leaf).tag() != hdr.type_tag {
            return Err(TreeError::Corruption("root type disagrees with its profile"));
        }
        store.ref_block(root)?;
        let shapes = Arc::new(ShapeTable::build(
            options.min_block_size,
            options.max_block_size,
        ));
        Ok(Self {
            store,
            registry,
            shapes,
            options,
            stats: Arc::new(TreeStats::default()),
            root,
            name: meta.name,
            profile,
        })
    }

    /// Returns a second handle sharing every block with this one.
    pub fn fork(&self) -> Result<Tree> {
        self.store.ref_block(self.root)?;
        tracing::debug!(target: "cowtree::cow", root = self.root.0, "forked tree");
        Ok(Tree {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            shapes: Arc::clone(&self.shapes),
            options: self.options.clone(),
            stats: Arc::new(TreeStats::default()),
            root: self.root,
            name: self.name,
            profile: self.profile,
        })
    }

    /// Drops this handle's reference to the root, freeing every block no
    /// other tree still references.
    pub fn release(self) -> Result<()> {
        tracing::debug!(target: "cowtree::cow", root = self.root.0, "releasing tree");
        self.release_block(self.root)
    }

    /// Current root block.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Container name.
    pub fn name(&self) -> CtrId {
        self.name
    }

    /// Node variants of the container.
    pub fn profile(&self) -> ContainerProfile {
        self.profile
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Live statistics counters of this handle.
    pub fn stats(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    /// Block store backing the tree.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Node type registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Structural capacity table.
    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Number of levels, leaves included.
    pub fn depth(&self) -> Result<usize> {
        let root = self.load(self.root)?;
        Ok(self.header(&root)?.level as usize + 1)
    }

    /// Looks up a block.
    pub fn load(&self, id: BlockId) -> Result<BlockHandle> {
        Ok(self.store.get_block(id)?)
    }

    /// Decodes a node's header.
    pub fn header(&self, node: &BlockHandle) -> Result<NodeHeader> {
        NodeHeader::decode(&node.read())
    }

    /// Variant of a node.
    pub fn node_kind(&self, node: &BlockHandle) -> Result<NodeKind> {
        let hdr = self.header(node)?;
        Ok(self.registry.lookup(hdr.type_tag)?.kind)
    }

    /// Runs `visitor` over the node's layout.
    pub fn dispatch<V: NodeVisitor>(&self, node: &BlockHandle, visitor: V) -> Result<V::Output> {
        self.registry.dispatch(&node.read(), visitor)
    }

    /// Content units of a node.
    pub fn node_size(&self, node: &BlockHandle) -> Result<usize> {
        self.dispatch(node, SizeOf)
    }

    /// Aggregate a node reports to its parent.
    pub fn node_summary(&self, node: &BlockHandle) -> Result<Summary> {
        self.dispatch(node, SummaryOf)
    }

    /// Child blocks of a node; empty for leaves.
    pub fn children(&self, node: &BlockHandle) -> Result<Vec<BlockId>> {
        self.dispatch(node, ChildrenOf)
    }

    /// Child `idx` of a branch.
    pub fn child(&self, node: &BlockHandle, idx: usize) -> Result<BlockId> {
        self.with_layout(node, |hdr, layout| {
            if hdr.leaf {
                return Err(TreeError::invariant("leaf has no children"));
            }
            branch::child(layout, idx)
        })
    }

    /// Runs `f` over the header and read-only layout of `node`.
    pub fn with_layout<R>(
        &self,
        node: &BlockHandle,
        f: impl FnOnce(&NodeHeader, &LayoutRef<'_>) -> Result<R>,
    ) -> Result<R> {
        let block = node.read();
        let hdr = NodeHeader::decode(&block)?;
        let layout = open_layout(&block)?;
        f(&hdr, &layout)
    }

    /// Fails unless no other owner references `id`.
    pub(crate) fn ensure_exclusive(&self, id: BlockId) -> Result<()> {
        if self.store.is_shared(id)? {
            return Err(TreeError::invariant(format!("write to shared block {id}")));
        }
        Ok(())
    }

    /// Runs `f` over the raw bytes of an exclusive block.
    pub(crate) fn update_block<R>(
        &self,
        node: &BlockHandle,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        self.ensure_exclusive(node.id())?;
        let mut block = node.write();
        f(&mut block)
    }

    /// Runs `f` over the header and writable layout of an exclusive node.
    pub(crate) fn update_layout<R>(
        &self,
        node: &BlockHandle,
        f: impl FnOnce(&NodeHeader, &mut LayoutMut<'_>) -> Result<R>,
    ) -> Result<R> {
        self.update_block(node, |block| {
            let hdr = NodeHeader::decode(block)?;
            let mut layout = open_layout_mut(block)?;
            f(&hdr, &mut layout)
        })
    }

    /// Drops one reference to `id`; blocks reaching zero are freed and their
    /// children released in turn.
    pub(crate) fn release_block(&self, id: BlockId) -> Result<()> {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if self.store.unref_block(id)? > 0 {
                continue;
            }
            let handle = self.load(id)?;
            let children = self.children(&handle)?;
            self.store.free_block(id)?;
            self.stats.inc_blocks_released();
            tracing::trace!(
                target: "cowtree::cow",
                block = id.0,
                children = children.len(),
                "released block"
            );
            pending.extend(children);
        }
        Ok(())
    }

    /// Path from `node` down `depth` levels along first children.
    pub fn build_path(&self, node: BlockHandle, depth: usize) -> Result<TreePath> {
        if depth == 0 {
            return Err(TreeError::Invalid("path depth must be positive"));
        }
        let mut chain = vec![(node, 0usize)];
        while chain.len() < depth {
            let parent = &chain[chain.len() - 1].0;
            if self.header(parent)?.leaf {
                return Err(TreeError::invariant("path deeper than the tree"));
            }
            let child = self.load(self.child(parent, 0)?)?;
            chain.push((child, 0));
        }
        Ok(TreePath::from_top_down(chain))
    }

    /// Path from the root to its first leaf.
    pub fn root_path(&self) -> Result<TreePath> {
        let root = self.load(self.root)?;
        let depth = self.header(&root)?.level as usize + 1;
        self.build_path(root, depth)
    }

    /// Path from the root to the leaf picked by `choose` at every branch.
    pub fn descend_path(
        &self,
        mut choose: impl FnMut(&LayoutRef<'_>) -> Result<usize>,
    ) -> Result<TreePath> {
        let mut node = self.load(self.root)?;
        let mut chain = Vec::new();
        let mut parent_idx = 0;
        loop {
            let next = self.with_layout(&node, |hdr, layout| {
                if hdr.leaf {
                    return Ok(None);
                }
                let idx = choose(layout)?;
                Ok(Some((idx, branch::child(layout, idx)?)))
            })?;
            chain.push((node, parent_idx));
            match next {
                None => break,
                Some((idx, child)) => {
                    node = self.load(child)?;
                    parent_idx = idx;
                }
            }
        }
        Ok(TreePath::from_top_down(chain))
    }

    /// Path from the root to its last leaf.
    pub fn last_path(&self) -> Result<TreePath> {
        self.descend_path(|layout| {
            branch::len(layout)
                .checked_sub(1)
                .ok_or_else(|| TreeError::invariant("descending into an empty branch"))
        })
    }

    /// Units stored before unit `idx` of `path[0]` across the whole tree.
    pub fn units_before(&self, path: &TreePath, idx: usize) -> Result<u64> {
        let mut units = idx as u64;
        for level in 0..path.top()? {
            let pidx = path.parent_idx(level)?;
            units += self.with_layout(path.node(level + 1)?, |_, layout| {
                branch::prefix_size(layout, pidx)
            })?;
        }
        Ok(units)
    }

    /// Path to the leaf holding unit `pos`, and the unit's index in that leaf.
    pub fn position_path(&self, pos: u64) -> Result<(TreePath, usize)> {
        let mut local = pos;
        let path = self.descend_path(|layout| {
            let (idx, before) = branch::find_position(layout, local)?
                .ok_or(TreeError::Invalid("unit position out of range"))?;
            local -= before;
            Ok(idx)
        })?;
        let local =
            usize::try_from(local).map_err(|_| TreeError::Invalid("unit position out of range"))?;
        Ok((path, local))
    }

    /// Retargets `path[level]` at `right`, the sibling just inserted after it,
    /// and refills the levels below with first children.
    pub fn follow_right(
        &self,
        path: &mut TreePath,
        level: usize,
        right: BlockHandle,
    ) -> Result<()> {
        let idx = path.parent_idx(level)? + 1;
        let parent = path.node(level + 1)?.clone();
        if self.child(&parent, idx)? != right.id() {
            return Err(TreeError::invariant(format!(
                "block {} is not the right sibling at level {level}",
                right.id()
            )));
        }
        path.set(level, right, idx)?;
        self.refill_below(path, level, Edge::First)
    }

    /// Rewrites every level below `level` to follow the first or last child
    /// of the level above.
    pub(crate) fn refill_below(&self, path: &mut TreePath, level: usize, edge: Edge) -> Result<()> {
        for l in (0..level).rev() {
            let parent = path.node(l + 1)?.clone();
            let idx = match edge {
                Edge::First => 0,
                Edge::Last => self
                    .node_size(&parent)?
                    .checked_sub(1)
                    .ok_or_else(|| TreeError::invariant("refilling below an empty branch"))?,
            };
            let child = self.load(self.child(&parent, idx)?)?;
            path.set(l, child, idx)?;
        }
        Ok(())
    }

    /// Units a node of `kind` can hold at `block_size`.
    pub fn capacity(&self, kind: NodeKind, root: bool, block_size: usize) -> usize {
        self.shapes.capacity(kind, root, block_size)
    }
}
