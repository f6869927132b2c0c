//! Type-tag dispatch from raw blocks to the concrete [`NodeLayout`].
//!
//! Visitors are generic over the layout, so each call monomorphises into a
//! plain match over [`NodeKind`]; there is no dynamic dispatch on the node
//! path.

use crate::storage::packed::{LayoutMut, LayoutRef};
use crate::types::block::NodeHeader;
use crate::types::{BlockId, Result, TreeError};

use super::branch::{BitmapBranch, MapBranch};
use super::common::{open_layout, open_layout_mut, NodeLayout, Summary};
use super::leaf_bitmap::BitmapLeaf;
use super::leaf_map::MapLeaf;
use super::registry::{NodeKind, NodeType, Registry};

/// Runs against a read-only node layout.
pub trait NodeVisitor {
    /// Result of the visit.
    type Output;
    /// Called with the layout type selected by the block's tag.
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<Self::Output>;
}

/// Runs against a writable node layout.
pub trait NodeVisitorMut {
    /// Result of the visit.
    type Output;
    /// Called with the layout type selected by the block's tag.
    fn visit<N: NodeLayout>(self, layout: &mut LayoutMut<'_>) -> Result<Self::Output>;
}

/// Runs against two nodes of the same type, the first writable.
pub trait PairVisitor {
    /// Result of the visit.
    type Output;
    /// Called with the shared layout type.
    fn visit<N: NodeLayout>(self, a: &mut LayoutMut<'_>, b: &LayoutRef<'_>)
        -> Result<Self::Output>;
}

/// Runs against two writable nodes of the same type.
pub trait PairVisitorMut {
    /// Result of the visit.
    type Output;
    /// Called with the shared layout type.
    fn visit<N: NodeLayout>(
        self,
        a: &mut LayoutMut<'_>,
        b: &mut LayoutMut<'_>,
    ) -> Result<Self::Output>;
}

/// Runs against a layout type without any block.
pub trait ShapeVisitor {
    /// Result of the visit.
    type Output;
    /// Called with the layout type of the requested kind.
    fn visit<N: NodeLayout>(self) -> Self::Output;
}

macro_rules! with_node_layout {
    ($kind:expr, $n:ident => $body:expr) => {
        match $kind {
            NodeKind::MapBranch => {
                type $n = MapBranch;
                $body
            }
            NodeKind::MapLeaf => {
                type $n = MapLeaf;
                $body
            }
            NodeKind::BitmapBranch => {
                type $n = BitmapBranch;
                $body
            }
            NodeKind::BitmapLeaf => {
                type $n = BitmapLeaf;
                $body
            }
        }
    };
}

/// Runs `visitor` against the layout type of `kind`.
pub fn dispatch_shape<V: ShapeVisitor>(kind: NodeKind, visitor: V) -> V::Output {
    with_node_layout!(kind, N => visitor.visit::<N>())
}

fn check_segments(ty: &NodeType, found: usize) -> Result<()> {
    if found != ty.segment_count() {
        return Err(TreeError::Corruption("segment count differs from node type"));
    }
    Ok(())
}

impl Registry {
    /// Decodes the header of `block` and looks up its node type.
    pub fn resolve(&self, block: &[u8]) -> Result<(NodeHeader, &NodeType)> {
        let hdr = NodeHeader::decode(block)?;
        let ty = self.lookup(hdr.type_tag)?;
        if ty.leaf != hdr.leaf {
            return Err(TreeError::Corruption("leaf flag disagrees with node type"));
        }
        Ok((hdr, ty))
    }

    /// Runs `visitor` over the read-only layout of `block`.
    pub fn dispatch<V: NodeVisitor>(&self, block: &[u8], visitor: V) -> Result<V::Output> {
        let (_, ty) = self.resolve(block)?;
        let layout = open_layout(block)?;
        check_segments(ty, layout.segments())?;
        with_node_layout!(ty.kind, N => visitor.visit::<N>(&layout))
    }

    /// Runs `visitor` over the writable layout of `block`.
    pub fn dispatch_mut<V: NodeVisitorMut>(&self, block: &mut [u8], visitor: V) -> Result<V::Output> {
        let kind = {
            let (_, ty) = self.resolve(block)?;
            ty.kind
        };
        let ty = self.node_type(kind);
        let mut layout = open_layout_mut(block)?;
        check_segments(ty, layout.segments())?;
        with_node_layout!(kind, N => visitor.visit::<N>(&mut layout))
    }

    fn pair_kind(&self, a: &[u8], b: &[u8]) -> Result<NodeKind> {
        let (_, ta) = self.resolve(a)?;
        let (_, tb) = self.resolve(b)?;
        if ta.tag != tb.tag {
            return Err(TreeError::invariant(format!(
                "pair dispatch over different node types {} and {}",
                ta.name, tb.name
            )));
        }
        Ok(ta.kind)
    }

    /// Runs `visitor` over `a` (writable) and `b` (read-only); both blocks
    /// must carry the same type tag.
    pub fn dispatch_pair<V: PairVisitor>(
        &self,
        a: &mut [u8],
        b: &[u8],
        visitor: V,
    ) -> Result<V::Output> {
        let kind = self.pair_kind(a, b)?;
        let ty = self.node_type(kind);
        let mut la = open_layout_mut(a)?;
        let lb = open_layout(b)?;
        check_segments(ty, la.segments())?;
        check_segments(ty, lb.segments())?;
        with_node_layout!(kind, N => visitor.visit::<N>(&mut la, &lb))
    }

    /// Runs `visitor` over two writable blocks of the same type.
    pub fn dispatch_pair_mut<V: PairVisitorMut>(
        &self,
        a: &mut [u8],
        b: &mut [u8],
        visitor: V,
    ) -> Result<V::Output> {
        let kind = self.pair_kind(a, b)?;
        let ty = self.node_type(kind);
        let mut la = open_layout_mut(a)?;
        let mut lb = open_layout_mut(b)?;
        check_segments(ty, la.segments())?;
        check_segments(ty, lb.segments())?;
        with_node_layout!(kind, N => visitor.visit::<N>(&mut la, &mut lb))
    }

    /// Runs `visitor` against the layout type of `kind`.
    pub fn dispatch_shape<V: ShapeVisitor>(&self, kind: NodeKind, visitor: V) -> V::Output {
        dispatch_shape(kind, visitor)
    }
}

/// Number of content units.
pub struct SizeOf;

impl NodeVisitor for SizeOf {
    type Output = usize;
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<usize> {
        N::size(layout)
    }
}

/// Aggregate the node reports to its parent.
pub struct SummaryOf;

impl NodeVisitor for SummaryOf {
    type Output = Summary;
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<Summary> {
        N::summary(layout)
    }
}

/// Aggregate over a unit range.
pub struct SummaryRange {
    /// First unit.
    pub start: usize,
    /// One past the last unit.
    pub end: usize,
}

impl NodeVisitor for SummaryRange {
    type Output = Summary;
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<Summary> {
        N::summary_range(layout, self.start, self.end)
    }
}

/// Child block ids; empty for leaves.
pub struct ChildrenOf;

impl NodeVisitor for ChildrenOf {
    type Output = Vec<BlockId>;
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<Vec<BlockId>> {
        let mut out = Vec::new();
        N::for_each_child(layout, &mut |id| out.push(id))?;
        Ok(out)
    }
}

/// Variant-specific stream validation.
pub struct CheckNode;

impl NodeVisitor for CheckNode {
    type Output = ();
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<()> {
        N::check(layout)
    }
}

/// Extra allocation the visited node needs to absorb `src`.
pub struct MergeGrowth<'a> {
    /// Block to be merged in; must have the visited node's type.
    pub src: &'a [u8],
}

impl NodeVisitor for MergeGrowth<'_> {
    type Output = usize;
    fn visit<N: NodeLayout>(self, layout: &LayoutRef<'_>) -> Result<usize> {
        if NodeHeader::decode(self.src)?.type_tag != N::KIND.tag() {
            return Err(TreeError::invariant("merge growth over different node types"));
        }
        N::merge_growth(layout, &open_layout(self.src)?)
    }
}

/// Writes empty variant streams into a fresh layout.
pub struct InitLayout;

impl NodeVisitorMut for InitLayout {
    type Output = ();
    fn visit<N: NodeLayout>(self, layout: &mut LayoutMut<'_>) -> Result<()> {
        N::init(layout)
    }
}

/// Moves units `at..` of the first node to the second.
pub struct SplitTo {
    /// First unit to move.
    pub at: usize,
}

impl PairVisitorMut for SplitTo {
    type Output = ();
    fn visit<N: NodeLayout>(self, a: &mut LayoutMut<'_>, b: &mut LayoutMut<'_>) -> Result<()> {
        N::split_to(a, b, self.at)
    }
}

/// Appends every unit of the second node to the first.
pub struct MergeFrom;

impl PairVisitor for MergeFrom {
    type Output = ();
    fn visit<N: NodeLayout>(self, a: &mut LayoutMut<'_>, b: &LayoutRef<'_>) -> Result<()> {
        N::merge_from(a, b)
    }
}

/// Drops units `start..end` of the visited node.
pub struct RemoveUnits {
    /// First unit dropped.
    pub start: usize,
    /// One past the last unit dropped.
    pub end: usize,
}

impl NodeVisitorMut for RemoveUnits {
    type Output = ();
    fn visit<N: NodeLayout>(self, layout: &mut LayoutMut<'_>) -> Result<()> {
        N::remove_units(layout, self.start, self.end)
    }
}

/// Names of the variant streams.
pub struct Streams;

impl ShapeVisitor for Streams {
    type Output = &'static [&'static str];
    fn visit<N: NodeLayout>(self) -> Self::Output {
        N::STREAMS
    }
}

/// Compacted stream bytes for a unit count.
pub struct StreamBytes {
    /// Unit count.
    pub units: usize,
}

impl ShapeVisitor for StreamBytes {
    type Output = usize;
    fn visit<N: NodeLayout>(self) -> usize {
        N::stream_bytes(self.units)
    }
}

/// Largest unit count whose streams fit in `avail` bytes.
pub struct Capacity {
    /// Bytes available to the streams.
    pub avail: usize,
}

impl ShapeVisitor for Capacity {
    type Output = usize;
    fn visit<N: NodeLayout>(self) -> usize {
        if N::stream_bytes(0) > self.avail {
            return 0;
        }
        let (mut lo, mut hi) = (0usize, self.avail.saturating_mul(8));
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if N::stream_bytes(mid) <= self.avail {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }
}
