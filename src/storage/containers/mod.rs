#![forbid(unsafe_code)]

//! Containers built on the copy-on-write tree.

mod bitmap;
mod map;

pub use bitmap::AllocationBitmap;
pub use map::CowMap;
