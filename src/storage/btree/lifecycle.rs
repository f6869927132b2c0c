//! Node creation, root status changes, root metadata, container properties
//! and block resizing.

use crate::primitives::bytes::align::{align_up, is_aligned};
use crate::primitives::store::BlockHandle;
use crate::storage::node::{
    open_layout, open_layout_mut, InitLayout, NodeKind, RootMetadata, EXT_DATA, METADATA, PROPERTIES,
};
use crate::storage::packed::{PackedLayout, PackedMap, Prepared};
use crate::types::block::{self, NodeHeader, NODE_HDR_LEN};
use crate::types::{Result, TreeError};

use super::cow::PathRepair;
use super::ctr::Tree;
use super::options::MIN_SUPPORTED_BLOCK_SIZE;
use super::path::TreePath;

/// Growing and shrinking node blocks.
pub trait NodeSizing {
    /// Block size `node` must reach for `bytes` more bytes of layout space,
    /// or `None` when that exceeds the maximum block size.
    fn can_upsize(&self, node: &BlockHandle, bytes: usize) -> Result<Option<usize>>;

    /// Grows `path[level]` until it has `bytes` free bytes. Returns false when
    /// the space was already there.
    fn upsize(&mut self, path: &mut TreePath, level: usize, bytes: usize) -> Result<bool>;

    /// Doubles the block of `path[level]`.
    fn upsize_2x(&mut self, path: &mut TreePath, level: usize) -> Result<()>;

    /// Shrinks `path[level]` when it uses less than half its block. Returns
    /// true when the block was resized.
    fn downsize(&mut self, path: &mut TreePath, level: usize) -> Result<bool>;

    /// Resizes the block of `path[level]` to exactly `new_size` bytes.
    fn resize_block(&mut self, path: &mut TreePath, level: usize, new_size: usize) -> Result<()>;
}

/// Contents of the three root segments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RootSegments {
    metadata: Vec<u8>,
    properties: Vec<u8>,
    ext_data: Vec<u8>,
}

impl RootSegments {
    fn parts(&self) -> [(usize, &[u8]); 3] {
        [
            (METADATA, &self.metadata),
            (PROPERTIES, &self.properties),
            (EXT_DATA, &self.ext_data),
        ]
    }
}

impl Tree {
    /// Block size for a new node: the hint, else the canonical size stored
    /// in the root, else the configured default.
    pub(crate) fn new_node_size(&self, size_hint: Option<usize>) -> Result<usize> {
        let size = match size_hint.filter(|size| *size > 0) {
            Some(size) => size,
            None => {
                let canonical = if self.root.is_null() {
                    0
                } else {
                    self.root_metadata()?.block_size as usize
                };
                if canonical > 0 {
                    canonical
                } else {
                    self.options.default_block_size
                }
            }
        };
        if !is_aligned(size) || size < MIN_SUPPORTED_BLOCK_SIZE || size > self.options.max_block_size
        {
            return Err(TreeError::Invalid("node block size out of range"));
        }
        Ok(size)
    }

    fn allocate_node(
        &self,
        kind: NodeKind,
        level: u16,
        root: bool,
        size: usize,
    ) -> Result<BlockHandle> {
        let handle = self.store.create_block(size, self.name)?;
        let init = {
            let mut bytes = handle.write();
            self.init_node(&mut bytes, kind, level, root, size)
        };
        if let Err(err) = init {
            self.store.free_block(handle.id())?;
            return Err(err);
        }
        self.stats.inc_nodes_created();
        tracing::trace!(
            target: "cowtree::sizing",
            block = handle.id().0,
            kind = kind.name(),
            level,
            root,
            size,
            "allocated node"
        );
        Ok(handle)
    }

    fn init_node(
        &self,
        bytes: &mut [u8],
        kind: NodeKind,
        level: u16,
        root: bool,
        size: usize,
    ) -> Result<()> {
        NodeHeader::new(kind.tag(), level, root, kind.is_leaf(), size)?.encode(bytes)?;
        let segments = self.registry.node_type(kind).segment_count();
        PackedLayout::init(&mut bytes[NODE_HDR_LEN..], segments)?;
        self.registry.dispatch_mut(bytes, InitLayout)
    }

    fn check_level(level: u16, is_leaf: bool) -> Result<()> {
        if is_leaf != (level == 0) {
            return Err(TreeError::Invalid("leaf nodes live on level 0 only"));
        }
        Ok(())
    }

    /// Root segments of the current root, or fresh ones for a new tree.
    pub(crate) fn root_segments(&self) -> Result<RootSegments> {
        if self.root.is_null() {
            let meta = RootMetadata {
                name: self.name,
                block_size: self.options.default_block_size as u32,
            };
            return Ok(RootSegments {
                metadata: meta.encode().to_vec(),
                properties: Vec::new(),
                ext_data: self.profile.ext_data().encode().to_vec(),
            });
        }
        let root = self.load(self.root)?;
        self.segments_of(&root)
    }

    fn segments_of(&self, node: &BlockHandle) -> Result<RootSegments> {
        self.with_layout(node, |hdr, layout| {
            if !hdr.root {
                return Err(TreeError::invariant("reading root segments from a non-root"));
            }
            Ok(RootSegments {
                metadata: layout.segment(METADATA).to_vec(),
                properties: layout.segment(PROPERTIES).to_vec(),
                ext_data: layout.segment(EXT_DATA).to_vec(),
            })
        })
    }

    fn write_root_segments(&self, node: &BlockHandle, segments: &RootSegments) -> Result<()> {
        self.update_layout(node, |_, layout| {
            let growth: usize = segments
                .parts()
                .iter()
                .map(|(seg, bytes)| layout.growth_needed(*seg, bytes.len()))
                .sum();
            if growth > layout.free_space() {
                return Err(TreeError::OutOfSpace {
                    needed: growth,
                    available: layout.free_space(),
                });
            }
            for (seg, bytes) in segments.parts() {
                layout.resize_segment(seg, bytes.len())?;
                layout.segment_mut(seg).copy_from_slice(bytes);
            }
            Ok(())
        })
    }

    /// Creates a root node, copying the root segments of the current root
    /// when there is one. The tree's root pointer is left unchanged.
    pub fn create_root_node(
        &self,
        level: u16,
        is_leaf: bool,
        size_hint: Option<usize>,
    ) -> Result<BlockHandle> {
        Self::check_level(level, is_leaf)?;
        let size = self.new_node_size(size_hint)?;
        let segments = self.root_segments()?;
        let node = self.allocate_node(self.profile.kind_for(is_leaf), level, true, size)?;
        if let Err(err) = self.write_root_segments(&node, &segments) {
            self.store.free_block(node.id())?;
            return Err(err);
        }
        Ok(node)
    }

    /// Creates a node without root segments.
    pub fn create_non_root_node(
        &self,
        level: u16,
        is_leaf: bool,
        size_hint: Option<usize>,
    ) -> Result<BlockHandle> {
        Self::check_level(level, is_leaf)?;
        let size = self.new_node_size(size_hint)?;
        self.allocate_node(self.profile.kind_for(is_leaf), level, false, size)
    }

    /// Creates a root or non-root node.
    pub fn create_node(
        &self,
        level: u16,
        is_root: bool,
        is_leaf: bool,
        size_hint: Option<usize>,
    ) -> Result<BlockHandle> {
        if is_root {
            self.create_root_node(level, is_leaf, size_hint)
        } else {
            self.create_non_root_node(level, is_leaf, size_hint)
        }
    }

    /// Clears the root flag and root segments of `node`.
    pub fn root_to_node(&self, node: &BlockHandle) -> Result<()> {
        self.update_block(node, |bytes| {
            let mut layout = open_layout_mut(bytes)?;
            for seg in [METADATA, PROPERTIES, EXT_DATA] {
                layout.resize_segment(seg, 0)?;
            }
            block::set_root_flag(bytes, false);
            Ok(())
        })
    }

    /// Gives `node` the root flag and a copy of the current root's segments.
    pub fn node_to_root(&self, node: &BlockHandle) -> Result<()> {
        if node.id() == self.root {
            return Err(TreeError::Invalid("node is already the root"));
        }
        let segments = self.root_segments()?;
        self.write_root_segments(node, &segments)?;
        self.update_block(node, |bytes| {
            block::set_root_flag(bytes, true);
            Ok(())
        })
    }

    /// Copies the root segments of `src` into `tgt`.
    pub fn copy_root_metadata(&self, src: &BlockHandle, tgt: &BlockHandle) -> Result<()> {
        let segments = self.segments_of(src)?;
        self.write_root_segments(tgt, &segments)
    }

    /// Returns true when `node` has room for the current root segments.
    pub fn can_convert_to_root(&self, node: &BlockHandle) -> Result<bool> {
        let segments = self.root_segments()?;
        self.with_layout(node, |_, layout| {
            let growth: usize = segments
                .parts()
                .iter()
                .map(|(seg, bytes)| layout.growth_needed(*seg, bytes.len()))
                .sum();
            Ok(growth <= layout.free_space())
        })
    }

    /// Metadata stored in the root.
    pub fn root_metadata(&self) -> Result<RootMetadata> {
        let root = self.load(self.root)?;
        self.with_layout(&root, |_, layout| RootMetadata::decode(layout.segment(METADATA)))
    }

    fn root_entry_path(&self) -> Result<TreePath> {
        let root = self.load(self.root)?;
        Ok(TreePath::from_top_down(vec![(root, 0)]))
    }

    fn writable_root(&mut self) -> Result<BlockHandle> {
        let mut path = self.root_entry_path()?;
        self.make_mutable(&mut path, 0)?;
        Ok(path.node(0)?.clone())
    }

    /// Replaces the metadata stored in the root.
    pub fn set_root_metadata(&mut self, meta: RootMetadata) -> Result<()> {
        let root = self.writable_root()?;
        self.update_layout(&root, |_, layout| layout.write_segment(METADATA, &meta.encode()))
    }

    /// Sets the canonical block size for nodes created from now on.
    pub fn set_new_block_size(&mut self, size: usize) -> Result<()> {
        if !size.is_power_of_two()
            || size < self.options.min_block_size
            || size > self.options.max_block_size
        {
            return Err(TreeError::Invalid("block size outside configured range"));
        }
        let mut meta = self.root_metadata()?;
        meta.block_size = size as u32;
        self.set_root_metadata(meta)
    }

    /// Container property `key`.
    pub fn property(&self, key: &str) -> Result<Option<String>> {
        let root = self.load(self.root)?;
        self.with_layout(&root, |_, layout| {
            Ok(PackedMap::new(layout.segment(PROPERTIES))
                .get(key)?
                .map(str::to_owned))
        })
    }

    /// Every container property in key order.
    pub fn properties(&self) -> Result<Vec<(String, String)>> {
        let root = self.load(self.root)?;
        self.with_layout(&root, |_, layout| PackedMap::new(layout.segment(PROPERTIES)).to_vec())
    }

    /// Sets container property `key`, growing the root when needed.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        loop {
            let root = self.load(self.root)?;
            let prepared = self.with_layout(&root, |_, layout| {
                PackedMap::prepare_set(layout, PROPERTIES, key, value)
            })?;
            match prepared {
                Prepared::Ready(update) => {
                    let root = self.writable_root()?;
                    return self
                        .update_layout(&root, |_, layout| PackedMap::commit(layout, PROPERTIES, update));
                }
                Prepared::NeedsSpace { .. } => {
                    let mut path = self.root_entry_path()?;
                    self.upsize_2x(&mut path, 0)?;
                }
                Prepared::Full => {
                    return Err(TreeError::OutOfSpace {
                        needed: key.len() + value.len(),
                        available: 0,
                    })
                }
            }
        }
    }

    /// Removes container property `key`; returns false when it was absent.
    pub fn remove_property(&mut self, key: &str) -> Result<bool> {
        let root = self.load(self.root)?;
        let update =
            self.with_layout(&root, |_, layout| PackedMap::prepare_remove(layout, PROPERTIES, key))?;
        match update {
            None => Ok(false),
            Some(update) => {
                let root = self.writable_root()?;
                self.update_layout(&root, |_, layout| PackedMap::commit(layout, PROPERTIES, update))?;
                Ok(true)
            }
        }
    }

    /// Replaces every container property.
    pub fn set_properties<'k>(
        &mut self,
        entries: impl IntoIterator<Item = (&'k str, &'k str)>,
    ) -> Result<()> {
        let bytes = PackedMap::encode(entries);
        loop {
            let root = self.load(self.root)?;
            let fits = self.with_layout(&root, |_, layout| {
                Ok(layout.can_resize(PROPERTIES, bytes.len()))
            })?;
            if fits {
                let root = self.writable_root()?;
                return self.update_layout(&root, |_, layout| {
                    layout.resize_segment(PROPERTIES, bytes.len())?;
                    layout.segment_mut(PROPERTIES).copy_from_slice(&bytes);
                    Ok(())
                });
            }
            let mut path = self.root_entry_path()?;
            self.upsize_2x(&mut path, 0)?;
        }
    }

    fn block_size_of(&self, node: &BlockHandle) -> Result<usize> {
        Ok(self.header(node)?.block_size as usize)
    }
}

impl NodeSizing for Tree {
    fn can_upsize(&self, node: &BlockHandle, bytes: usize) -> Result<Option<usize>> {
        let (size, free) = self.with_layout(node, |hdr, layout| {
            Ok((hdr.block_size as usize, layout.free_space()))
        })?;
        let need = align_up(bytes);
        if free >= need {
            return Ok(Some(size));
        }
        let mut target = size;
        while free + (target - size) < need {
            target = target.saturating_mul(2);
            if target > self.options.max_block_size {
                return Ok(None);
            }
        }
        Ok(Some(target))
    }

    fn upsize(&mut self, path: &mut TreePath, level: usize, bytes: usize) -> Result<bool> {
        let node = path.node(level)?.clone();
        let size = self.block_size_of(&node)?;
        match self.can_upsize(&node, bytes)? {
            None => {
                let available = self.with_layout(&node, |_, layout| Ok(layout.free_space()))?;
                Err(TreeError::OutOfSpace {
                    needed: bytes,
                    available,
                })
            }
            Some(target) if target == size => Ok(false),
            Some(target) => {
                self.resize_block(path, level, target)?;
                self.stats.inc_upsizes();
                tracing::trace!(
                    target: "cowtree::sizing",
                    block = path.id(level)?.0,
                    from = size,
                    to = target,
                    "upsized node"
                );
                Ok(true)
            }
        }
    }

    fn upsize_2x(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        let node = path.node(level)?.clone();
        let size = self.block_size_of(&node)?;
        let target = size.saturating_mul(2);
        if target > self.options.max_block_size {
            return Err(TreeError::OutOfSpace {
                needed: target,
                available: self.options.max_block_size,
            });
        }
        self.resize_block(path, level, target)?;
        self.stats.inc_upsizes();
        Ok(())
    }

    fn downsize(&mut self, path: &mut TreePath, level: usize) -> Result<bool> {
        let node = path.node(level)?.clone();
        let (size, required) = self.with_layout(&node, |hdr, layout| {
            Ok((hdr.block_size as usize, NODE_HDR_LEN + layout.required_len()))
        })?;
        let floor = self.options.min_block_size;
        if size <= floor || size <= 2 * required {
            return Ok(false);
        }
        let mut target = floor;
        while target < required {
            target *= 2;
        }
        if target >= size {
            return Ok(false);
        }
        self.resize_block(path, level, target)?;
        self.stats.inc_downsizes();
        tracing::trace!(
            target: "cowtree::sizing",
            block = path.id(level)?.0,
            from = size,
            to = target,
            "downsized node"
        );
        Ok(true)
    }

    fn resize_block(&mut self, path: &mut TreePath, level: usize, new_size: usize) -> Result<()> {
        if !is_aligned(new_size) || new_size < MIN_SUPPORTED_BLOCK_SIZE {
            return Err(TreeError::Invalid("block size not aligned or too small"));
        }
        if new_size > u32::MAX as usize {
            return Err(TreeError::Invalid("block size exceeds u32"));
        }
        self.make_mutable(path, level)?;
        let node = path.node(level)?.clone();
        let size = self.block_size_of(&node)?;
        if new_size < size {
            self.update_layout(&node, |_, layout| {
                layout.compact();
                let required = NODE_HDR_LEN + layout.required_len();
                if required > new_size {
                    return Err(TreeError::OutOfSpace {
                        needed: required,
                        available: new_size,
                    });
                }
                Ok(())
            })?;
        }
        self.store.resize_block(&node, new_size)?;
        self.update_block(&node, |bytes| {
            block::set_block_size(bytes, new_size as u32);
            open_layout(bytes).map(|_| ())
        })
    }
}
