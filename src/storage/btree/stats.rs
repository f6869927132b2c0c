use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Nodes split in two
    pub splits: u64,
    /// Sibling merges performed
    pub merges: u64,
    /// New roots created above the old one
    pub root_promotions: u64,
    /// Single-child roots replaced by their child
    pub root_demotions: u64,
    /// Shared nodes copied before a write
    pub clones: u64,
    /// Blocks grown
    pub upsizes: u64,
    /// Blocks shrunk
    pub downsizes: u64,
    /// Nodes allocated, clones excluded
    pub nodes_created: u64,
    /// Blocks freed after their last reference was dropped
    pub blocks_released: u64,
}

/// Thread-safe statistics tracking for structural tree operations.
#[derive(Default)]
pub struct TreeStats {
    splits: AtomicU64,
    merges: AtomicU64,
    root_promotions: AtomicU64,
    root_demotions: AtomicU64,
    clones: AtomicU64,
    upsizes: AtomicU64,
    downsizes: AtomicU64,
    nodes_created: AtomicU64,
    blocks_released: AtomicU64,
}

impl TreeStats {
    /// Returns the number of node splits.
    pub fn splits(&self) -> u64 {
        self.splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of sibling merges.
    pub fn merges(&self) -> u64 {
        self.merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root promotions.
    pub fn root_promotions(&self) -> u64 {
        self.root_promotions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root demotions.
    pub fn root_demotions(&self) -> u64 {
        self.root_demotions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of copy-on-write clones.
    pub fn clones(&self) -> u64 {
        self.clones.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of block upsizes.
    pub fn upsizes(&self) -> u64 {
        self.upsizes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of block downsizes.
    pub fn downsizes(&self) -> u64 {
        self.downsizes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes created.
    pub fn nodes_created(&self) -> u64 {
        self.nodes_created.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of blocks released.
    pub fn blocks_released(&self) -> u64 {
        self.blocks_released.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_promotions(&self) {
        self.root_promotions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_demotions(&self) {
        self.root_demotions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_clones(&self) {
        self.clones.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_upsizes(&self) {
        self.upsizes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_downsizes(&self) {
        self.downsizes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_nodes_created(&self) {
        self.nodes_created.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_blocks_released(&self) {
        self.blocks_released
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            splits: self.splits(),
            merges: self.merges(),
            root_promotions: self.root_promotions(),
            root_demotions: self.root_demotions(),
            clones: self.clones(),
            upsizes: self.upsizes(),
            downsizes: self.downsizes(),
            nodes_created: self.nodes_created(),
            blocks_released: self.blocks_released(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "cowtree::stats",
            splits = snapshot.splits,
            merges = snapshot.merges,
            root_promotions = snapshot.root_promotions,
            root_demotions = snapshot.root_demotions,
            clones = snapshot.clones,
            upsizes = snapshot.upsizes,
            downsizes = snapshot.downsizes,
            nodes_created = snapshot.nodes_created,
            blocks_released = snapshot.blocks_released,
            "tree stats snapshot"
        );
    }
}
