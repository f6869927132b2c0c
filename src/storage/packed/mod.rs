#![forbid(unsafe_code)]

//! Packed, resizable segment layout stored inside a node block, plus the
//! typed segment formats nodes are built from.

mod array;
mod bitmap;
mod index;
mod layout;
mod map;
mod update;

pub use array::{U64Array, U64ArrayMut};
pub use bitmap::{Bitmap, BitmapMut};
pub use index::{SumIndex, FANOUT};
pub use layout::{
    LayoutMut, LayoutRef, PackedLayout, DESCRIPTOR_LEN, FORMAT_VERSION, LAYOUT_HDR_LEN,
};
pub use map::{MapUpdate, PackedMap};
pub use update::Prepared;
