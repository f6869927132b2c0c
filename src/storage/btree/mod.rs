#![forbid(unsafe_code)]

//! Copy-on-write B-tree core.
//!
//! [`Tree`] owns the root of one container and drives every structural
//! change through a [`TreePath`]: lifecycle and sizing live in
//! [`NodeSizing`], copy-on-write and sibling navigation in [`PathRepair`],
//! splits and merges in [`StructuralMutation`]. Containers such as
//! [`CowMap`](crate::storage::containers::CowMap) sit on top and only
//! decide where content goes.

mod cow;
mod ctr;
mod lifecycle;
mod options;
mod path;
mod stats;
mod structure;
mod verify;

pub use cow::PathRepair;
pub use ctr::{ContainerProfile, Tree};
pub use lifecycle::NodeSizing;
pub use options::{TreeOptions, MAX_SUPPORTED_BLOCK_SIZE, MIN_SUPPORTED_BLOCK_SIZE};
pub use path::{PathEntry, TreePath};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use structure::StructuralMutation;
pub use verify::{BlockDescription, VerifyFinding, VerifyReport, VerifySeverity};
