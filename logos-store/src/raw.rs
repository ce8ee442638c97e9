//! Unversioned `(meta, body)` records in named keyspaces, for local
//! bookkeeping that lives outside the revision model.

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::storage::record::{ContentOptions, Record};
use crate::storage::rocks::INTERNAL_KEYSPACES;
use crate::storage::transaction::WriteSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
}

fn check_keyspace(name: &str) -> Result<()> {
    if name.is_empty() || INTERNAL_KEYSPACES.contains(&name) {
        return Err(StoreError::BadRequest(format!(
            "'{name}' is not a raw keyspace"
        )));
    }
    Ok(())
}

impl Database {
    /// Read a raw record, seeing this handle's uncommitted writes.
    pub fn raw_get(&self, keyspace: &str, key: &[u8]) -> Result<RawDocument> {
        check_keyspace(keyspace)?;
        let bytes = self.read(keyspace, key)?.ok_or_else(|| {
            StoreError::NotFound(format!(
                "raw record '{}' in '{keyspace}'",
                String::from_utf8_lossy(key)
            ))
        })?;
        let record = Record::decode(&bytes, ContentOptions::Full)?;
        Ok(RawDocument {
            key: key.to_vec(),
            meta: record.meta,
            body: record.body.unwrap_or_default(),
        })
    }

    /// Store a raw record. Empty `meta` and `body` together delete it.
    ///
    /// Runs in its own transaction level: outside any transaction it commits
    /// immediately, inside one it joins it. A failure leaves nothing staged.
    pub fn raw_put(&self, keyspace: &str, key: &[u8], meta: &[u8], body: &[u8]) -> Result<()> {
        check_keyspace(keyspace)?;
        self.begin_transaction()?;
        let staged = self.stage_raw_put(keyspace, key, meta, body);
        match staged {
            Ok(()) => self.end_transaction(true),
            Err(e) => {
                if let Err(abort) = self.end_transaction(false) {
                    log::warn!("Abort after failed raw put also failed: {abort}");
                }
                Err(e)
            }
        }
    }

    fn stage_raw_put(&self, keyspace: &str, key: &[u8], meta: &[u8], body: &[u8]) -> Result<()> {
        let mut writes = WriteSet::default();
        if meta.is_empty() && body.is_empty() {
            writes.delete(keyspace, key);
        } else {
            self.store().ensure_keyspace(keyspace)?;
            writes.put(keyspace, key, Record::encode(0, meta, body, false)?);
        }
        self.apply(writes)
    }
}
