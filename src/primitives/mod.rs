//! Low-level primitives for building the tree core.
//!
//! Includes byte utilities and the block store abstraction nodes live in.

/// Byte-level utilities and encoding/decoding.
///
/// Little-endian field access, alignment math and varints.
pub mod bytes;

/// Block storage.
///
/// The [`BlockStore`](store::BlockStore) trait the tree consumes, plus an
/// in-memory reference-counted implementation.
pub mod store;
