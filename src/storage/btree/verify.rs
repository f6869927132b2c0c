//! Whole-tree consistency checks and block inspection.

use std::fmt::Write as _;

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::primitives::store::BlockHandle;
use crate::storage::node::branch;
use crate::storage::node::{open_layout, CheckNode, SizeOf, FIRST_STREAM};
use crate::types::block::NODE_HDR_LEN;
use crate::types::{block_crc32, BlockId, Result};

use super::ctr::Tree;

const MAX_FINDINGS: usize = 64;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Non-critical issue, such as a block that could be smaller.
    Warning,
    /// Broken structural invariant.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Block the finding is about.
    pub block: u64,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Result of [`Tree::verify`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Nodes visited.
    pub nodes: u64,
    /// Leaves visited.
    pub leaves: u64,
    /// Levels, leaves included.
    pub depth: u64,
    /// Content units held by the leaves.
    pub units: u64,
    /// Block bytes of every visited node.
    pub bytes: u64,
    /// Issues found; capped.
    pub findings: Vec<VerifyFinding>,
}

impl VerifyReport {
    /// Returns true when no error was found.
    pub fn is_clean(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|finding| finding.severity == VerifySeverity::Error)
    }

    fn push(&mut self, severity: VerifySeverity, block: BlockId, message: impl Into<String>) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(VerifyFinding {
                severity,
                block: block.0,
                message: message.into(),
            });
        }
    }

    fn error(&mut self, block: BlockId, message: impl Into<String>) {
        self.push(VerifySeverity::Error, block, message);
    }
}

/// Summary of one block for inspection tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockDescription {
    /// Block id.
    pub id: u64,
    /// Registered name of the node type.
    pub type_name: &'static str,
    /// Tree level.
    pub level: u16,
    /// Root flag.
    pub root: bool,
    /// Leaf flag.
    pub leaf: bool,
    /// Declared block size.
    pub block_size: u32,
    /// Bytes used by segment contents.
    pub used_bytes: usize,
    /// Unallocated layout bytes.
    pub free_bytes: usize,
    /// Current reference count.
    pub ref_count: u32,
    /// CRC32 over the id and the block bytes.
    pub crc32: u32,
}

struct Visit {
    id: BlockId,
    level: u16,
    top: bool,
}

impl Tree {
    /// Walks every node reachable from the root and reports structural
    /// problems. Only store failures abort the walk.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let root = self.load(self.root)?;
        let root_level = match self.header(&root) {
            Ok(hdr) => hdr.level,
            Err(err) => {
                report.error(self.root, format!("root header unreadable: {err}"));
                return Ok(report);
            }
        };
        report.depth = root_level as u64 + 1;

        let mut seen = FxHashSet::default();
        let mut stack = vec![Visit {
            id: self.root,
            level: root_level,
            top: true,
        }];
        while let Some(visit) = stack.pop() {
            if !seen.insert(visit.id) {
                report.error(visit.id, "block reachable twice");
                continue;
            }
            let node = self.load(visit.id)?;
            self.verify_node(&node, &visit, &mut report, &mut stack)?;
        }
        tracing::debug!(
            target: "cowtree::stats",
            nodes = report.nodes,
            units = report.units,
            findings = report.findings.len(),
            "verified tree"
        );
        Ok(report)
    }

    fn verify_node(
        &self,
        node: &BlockHandle,
        visit: &Visit,
        report: &mut VerifyReport,
        stack: &mut Vec<Visit>,
    ) -> Result<()> {
        let id = node.id();
        report.nodes += 1;
        report.bytes += node.len() as u64;
        if self.store.ref_count(id)? == 0 {
            report.error(id, "reachable block has no references");
        }
        let block = node.read();
        let (hdr, ty) = match self.registry.resolve(&block) {
            Ok(resolved) => resolved,
            Err(err) => {
                report.error(id, format!("header: {err}"));
                return Ok(());
            }
        };
        if hdr.level != visit.level {
            report.error(id, format!("level {} where {} expected", hdr.level, visit.level));
        }
        if hdr.root != visit.top {
            report.error(id, format!("root flag {} on a node at the top: {}", hdr.root, visit.top));
        }
        if ty.kind != self.profile.kind_for(hdr.leaf) {
            report.error(id, format!("node type {} outside the container profile", ty.name));
        }
        if let Err(err) = self.registry.dispatch(&block, CheckNode) {
            report.error(id, format!("layout: {err}"));
            return Ok(());
        }
        let layout = open_layout(&block)?;
        if !hdr.root && (0..FIRST_STREAM).any(|seg| layout.used(seg) != 0) {
            report.error(id, "root segments filled outside the root");
        }
        let size = hdr.block_size as usize;
        if size > self.options.min_block_size && NODE_HDR_LEN + layout.required_len() < size / 4 {
            report.push(VerifySeverity::Warning, id, "block uses under a quarter of its size");
        }
        if hdr.leaf {
            report.leaves += 1;
            report.units += self.registry.dispatch(&block, SizeOf)? as u64;
            return Ok(());
        }
        if branch::len(&layout) == 0 {
            report.error(id, "branch without children");
        }
        for (idx, child) in branch::child_ids(&layout).into_iter().enumerate() {
            let stored = branch::entry(&layout, idx)?;
            match self.load(child).and_then(|handle| self.node_summary(&handle)) {
                Ok(actual) if actual != stored => report.error(
                    id,
                    format!("entry {idx} holds {stored:?}, child {child} reports {actual:?}"),
                ),
                Ok(_) => {}
                Err(err) => report.error(id, format!("child {child}: {err}")),
            }
            stack.push(Visit {
                id: child,
                level: hdr.level.wrapping_sub(1),
                top: false,
            });
        }
        Ok(())
    }

    /// Describes block `id`.
    pub fn describe_block(&self, id: BlockId) -> Result<BlockDescription> {
        let node = self.load(id)?;
        let ref_count = self.store.ref_count(id)?;
        let block = node.read();
        let (hdr, ty) = self.registry.resolve(&block)?;
        let layout = open_layout(&block)?;
        Ok(BlockDescription {
            id: id.0,
            type_name: ty.name,
            level: hdr.level,
            root: hdr.root,
            leaf: hdr.leaf,
            block_size: hdr.block_size,
            used_bytes: layout.used_bytes(),
            free_bytes: layout.free_space(),
            ref_count,
            crc32: block_crc32(id.0, &block),
        })
    }

    /// Renders the header and every segment of `node` as hex.
    pub fn dump_node(&self, node: &BlockHandle) -> Result<String> {
        let block = node.read();
        let (hdr, ty) = self.registry.resolve(&block)?;
        let layout = open_layout(&block)?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "block {} {} level={} root={} leaf={} size={} free={}",
            node.id(),
            ty.name,
            hdr.level,
            hdr.root,
            hdr.leaf,
            hdr.block_size,
            layout.free_space()
        );
        for seg in 0..layout.segments() {
            let _ = writeln!(
                out,
                "  [{seg}] {:<10} used={:<5} alloc={:<5} {}",
                ty.segment_name(seg).unwrap_or("?"),
                layout.used(seg),
                layout.allocation(seg),
                hex::encode(layout.segment(seg))
            );
        }
        Ok(out)
    }
}
