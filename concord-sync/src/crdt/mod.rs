//! Conflict-free replicated data types backing shared documents.
//!
//! - [`list`]: RGA sequence with tombstoned deletes
//! - [`map`]: last-write-wins key/value registers
//!
//! Both structures are plain in-memory values. They know nothing about the
//! wire or about ordering between actors; the command protocol gates what
//! reaches them.

pub mod list;
pub mod map;

pub use list::{sibling_order, Anchor, ListValue, NodeId, Rga, ROOT};
pub use map::LwwMap;

/// Errors raised by the CRDT layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CrdtError {
    #[error("Invalid element id: '{0}'")]
    InvalidId(String),

    #[error("Index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}
