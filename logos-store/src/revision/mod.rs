//! Revision identifiers and the per-document revision tree.

pub mod revid;
pub mod tree;

pub use revid::RevId;
pub use tree::{Body, RevTree, Revision, RevisionFlags};
