//! # logos-store: Revision-tree document store for Logos
//!
//! Embedded, transactional document storage on RocksDB. Every document keeps
//! a tree of revisions so concurrent edits from different replicas can be
//! stored side by side, detected as conflicts and resolved later.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  insert / select   ┌──────────────┐
//! │ Document     │ ◄────────────────► │ RevTree      │
//! │ (value)      │                    │ (arena)      │
//! └──────┬───────┘                    └──────────────┘
//!        │ get / save / purge
//!        ▼
//! ┌──────────────┐   staged writes    ┌──────────────────────┐
//! │ Database     │ ─────────────────► │ TransactionController│
//! │ (handle)     │                    │ (nesting + WriteSet) │
//! └──────┬───────┘                    └──────────┬───────────┘
//!        │ snapshots                             │ one batch per commit
//!        ▼                                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ RocksDB: documents · sequences · bodies · expiry · raw   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`revision`]: Revision IDs and the revision tree (insert, history, prune)
//! - [`document`]: Loaded document with a revision cursor
//! - [`database`]: Handle, transactions, save/load/purge, compaction
//! - [`enumerator`]: All-docs and changes enumeration over snapshots
//! - [`expiry`]: Timestamp index and the purge sweep
//! - [`raw`]: Unversioned records in auxiliary keyspaces
//! - [`storage`]: RocksDB binding, record layout, collatable keys
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Save (1KB body, 20-deep tree) | <50μs |
//! | Load current revision | <20μs |
//! | Changes enumeration, meta-only | >500K docs/s |

pub mod database;
pub mod document;
pub mod enumerator;
pub mod error;
pub mod expiry;
pub mod raw;
pub mod revision;
pub mod storage;

// Re-exports for convenience
pub use database::Database;
pub use document::{Document, DocumentFlags};
pub use enumerator::{DocEnumerator, EnumeratorOptions};
pub use error::{ErrorDomain, Result, StoreError};
pub use expiry::{ExpiryEntry, ExpiryEnumerator};
pub use raw::RawDocument;
pub use revision::{Body, RevId, RevTree, Revision, RevisionFlags};
pub use storage::{CollatableBuilder, CollatableReader, ContentOptions, StoreConfig};
