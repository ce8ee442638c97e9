//! Nested transaction bookkeeping for one database handle.
//!
//! ```text
//!  begin ─► depth 0→1 opens a WriteSet ─┐
//!  begin ─► depth 1→2 (shares it)       │ writes staged here
//!  end   ─► depth 2→1                   │
//!  end   ─► depth 1→0 commit / abort ◄──┘ one RocksDB WriteBatch
//! ```
//!
//! Only the outermost `end` decides the fate of the staged writes. Inner
//! aborts are not partial rollbacks.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};

/// Pending puts (`Some`) and deletes (`None`), keyed by keyspace and key.
///
/// Later writes to the same key replace earlier ones, so the set collapses
/// into a single batch on commit.
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    writes: BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>,
}

impl WriteSet {
    pub fn put(&mut self, keyspace: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.writes
            .insert((keyspace.to_string(), key.into()), Some(value.into()));
    }

    pub fn delete(&mut self, keyspace: &str, key: impl Into<Vec<u8>>) {
        self.writes.insert((keyspace.to_string(), key.into()), None);
    }

    /// `Some(None)` means the key is staged for deletion.
    pub fn get(&self, keyspace: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes
            .get(&(keyspace.to_string(), key.to_vec()))
            .map(|v| v.as_deref())
    }

    /// Staged keys (puts and deletes) in `keyspace` starting with `prefix`.
    pub fn keys_with_prefix(&self, keyspace: &str, prefix: &[u8]) -> Vec<Vec<u8>> {
        let start = (keyspace.to_string(), prefix.to_vec());
        self.writes
            .range(start..)
            .take_while(|((ks, key), _)| ks == keyspace && key.starts_with(prefix))
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Fold `other` into this set; its writes win.
    pub fn merge(&mut self, other: WriteSet) {
        self.writes.extend(other.writes);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8], Option<&[u8]>)> {
        self.writes
            .iter()
            .map(|((ks, key), value)| (ks.as_str(), key.as_slice(), value.as_deref()))
    }
}

/// The single atomic-commit context shared by every nesting level.
#[derive(Debug)]
pub struct OpenTransaction {
    writes: WriteSet,
    base_sequence: u64,
    allocated: u64,
}

impl OpenTransaction {
    fn new(base_sequence: u64) -> Self {
        Self {
            writes: WriteSet::default(),
            base_sequence,
            allocated: 0,
        }
    }

    /// The sequence the next save would receive; not reserved until
    /// [`OpenTransaction::apply`] consumes it.
    pub fn peek_sequence(&self) -> u64 {
        self.base_sequence + self.allocated + 1
    }

    /// Stage a complete unit of work, optionally consuming one sequence.
    pub fn apply(&mut self, writes: WriteSet, consume_sequence: bool) {
        self.writes.merge(writes);
        if consume_sequence {
            self.allocated += 1;
        }
    }

    pub fn writes(&self) -> &WriteSet {
        &self.writes
    }

    /// Highest sequence handed out so far.
    pub fn last_sequence(&self) -> u64 {
        self.base_sequence + self.allocated
    }

    pub fn into_writes(self) -> WriteSet {
        self.writes
    }
}

/// What the caller must do after [`TransactionController::end`].
#[derive(Debug)]
pub enum TransactionEnd {
    /// An inner level closed; nothing to do yet.
    Nested,
    /// Outermost level closed with commit; write this out.
    Commit(OpenTransaction),
    /// Outermost level closed with abort; discard this.
    Abort(OpenTransaction),
}

/// Nesting counter plus the optional open context.
#[derive(Debug, Default)]
pub struct TransactionController {
    depth: u32,
    open: Option<OpenTransaction>,
}

impl TransactionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Returns true when this call opened the outermost level.
    pub fn begin(&mut self, base_sequence: u64) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            self.open = Some(OpenTransaction::new(base_sequence));
            true
        } else {
            false
        }
    }

    pub fn end(&mut self, commit: bool) -> Result<TransactionEnd> {
        if self.depth == 0 {
            return Err(StoreError::Precondition(format!(
                "end_transaction({commit}) called with no open transaction"
            )));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(TransactionEnd::Nested);
        }
        let open = self
            .open
            .take()
            .ok_or_else(|| StoreError::Internal("transaction depth without context".into()))?;
        Ok(if commit {
            TransactionEnd::Commit(open)
        } else {
            TransactionEnd::Abort(open)
        })
    }

    /// The open context, or `Precondition` when no transaction is active.
    pub fn open_mut(&mut self) -> Result<&mut OpenTransaction> {
        self.open
            .as_mut()
            .ok_or_else(|| StoreError::Precondition("write requires an open transaction".into()))
    }

    pub fn pending(&self) -> Option<&WriteSet> {
        self.open.as_ref().map(OpenTransaction::writes)
    }
}
