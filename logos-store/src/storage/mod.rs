//! Storage layer beneath the document model.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  staged writes  ┌────────────────────┐
//! │ Database     │ ──────────────► │ TransactionControl │
//! │ (documents)  │                 │ (WriteSet overlay) │
//! └──────┬───────┘                 └─────────┬──────────┘
//!        │ point reads / snapshots           │ one WriteBatch on commit
//!        ▼                                   ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ KeyValueStore (RocksDB)                              │
//! │ CF "default"     docID → record                      │
//! │ CF "sequences"   sequence → docID                    │
//! │ CF "bodies"      [docID, revID, seq] → archived body │
//! │ CF "expiry"      [timestamp, docID] → ()             │
//! │ CF <other>       raw keyspaces                       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Keys in `bodies` and `expiry` use the [`collatable`] encoding so byte
//! order matches value order.

pub mod collatable;
pub mod record;
pub mod rocks;
pub mod transaction;

pub use collatable::{CollatableBuilder, CollatableReader, CollatableTag};
pub use record::ContentOptions;
pub use rocks::StoreConfig;
pub use transaction::{OpenTransaction, TransactionController, TransactionEnd, WriteSet};
