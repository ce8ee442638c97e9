//! Time-ordered expiry index and the purge sweep that consumes it.
//!
//! Keys are collatable `[timestamp, doc_id]` arrays, so byte order is
//! timestamp order and "everything due by `now`" is a scan from the first
//! key up to the bound `[now, {}]` (a map sorts after any doc ID).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::database::Database;
use crate::error::Result;
use crate::storage::collatable::{CollatableBuilder, CollatableReader};
use crate::storage::rocks::{Scan, KS_EXPIRY};
use crate::storage::transaction::WriteSet;

pub(crate) fn expiry_key(timestamp: i64, doc_id: &[u8]) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array().add_int(timestamp).add_bytes(doc_id).end_array();
    key.into_bytes()
}

/// Smallest key greater than every entry due at `now`.
fn end_key(now: i64) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array().add_int(now).begin_map().end_map().end_array();
    key.into_bytes()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// One due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub timestamp: i64,
    pub doc_id: Vec<u8>,
    key: Vec<u8>,
}

impl ExpiryEntry {
    /// The encoded index key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    fn decode(key: &[u8]) -> Result<Self> {
        let mut reader = CollatableReader::new(key);
        reader.begin_array()?;
        let timestamp = reader.read_int()?;
        let doc_id = reader.read_bytes()?;
        reader.end_array()?;
        Ok(Self {
            timestamp,
            doc_id,
            key: key.to_vec(),
        })
    }
}

/// Enumerates entries whose timestamp is at or before a fixed "now".
///
/// "Now" is captured once at construction and kept across
/// [`reset`](ExpiryEnumerator::reset), so a sweep never chases entries
/// that come due while it runs.
pub struct ExpiryEnumerator<'a> {
    db: &'a Database,
    now: i64,
    end_key: Vec<u8>,
    scan: Option<Scan<'a>>,
    positioned: bool,
    done: bool,
}

impl<'a> ExpiryEnumerator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_now(db, unix_now())
    }

    pub fn with_now(db: &'a Database, now: i64) -> Self {
        let mut enumerator = Self {
            db,
            now,
            end_key: end_key(now),
            scan: None,
            positioned: false,
            done: false,
        };
        enumerator.reset();
        enumerator
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    /// Restart from the beginning against a fresh snapshot.
    pub fn reset(&mut self) {
        self.scan = Some(self.db.store().snapshot().scan(KS_EXPIRY));
        self.positioned = false;
        self.done = false;
    }

    /// Release the snapshot; the enumerator yields nothing until reset.
    pub fn close(&mut self) {
        self.scan = None;
        self.done = true;
    }

    fn step(&mut self) -> Result<Option<ExpiryEntry>> {
        if self.done {
            return Ok(None);
        }
        let Some(scan) = self.scan.as_mut() else {
            return Ok(None);
        };
        if self.positioned {
            scan.next();
        } else {
            scan.seek_to_first();
            self.positioned = true;
        }
        match scan.entry()? {
            Some((key, _)) if key < self.end_key.as_slice() => ExpiryEntry::decode(key).map(Some),
            _ => Ok(None),
        }
    }

    /// Delete every due entry and purge its document, all in one
    /// transaction. Returns the number of entries removed.
    ///
    /// Any failure aborts the whole sweep.
    pub fn purge_expired(&mut self) -> Result<usize> {
        self.db.begin_transaction()?;
        match self.stage_purge() {
            Ok(count) => {
                self.db.end_transaction(true)?;
                log::info!("Purged {count} expired entries (now = {})", self.now);
                Ok(count)
            }
            Err(e) => {
                if let Err(abort) = self.db.end_transaction(false) {
                    log::warn!("Abort after failed expiry purge also failed: {abort}");
                }
                Err(e)
            }
        }
    }

    fn stage_purge(&mut self) -> Result<usize> {
        self.reset();
        let mut writes = WriteSet::default();
        let mut purged: HashSet<Vec<u8>> = HashSet::new();
        let mut count = 0;
        while let Some(entry) = self.next().transpose()? {
            writes.delete(KS_EXPIRY, entry.key);
            if purged.insert(entry.doc_id.clone()) {
                self.db.stage_purge(&entry.doc_id, &mut writes)?;
            }
            count += 1;
        }
        self.db.apply(writes)?;
        Ok(count)
    }
}

impl Iterator for ExpiryEnumerator<'_> {
    type Item = Result<ExpiryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Database {
    /// Entries due as of the current wall-clock time.
    pub fn enumerate_expired(&self) -> ExpiryEnumerator<'_> {
        ExpiryEnumerator::new(self)
    }

    /// Purge everything due as of the current wall-clock time.
    pub fn purge_expired(&self) -> Result<usize> {
        ExpiryEnumerator::new(self).purge_expired()
    }

    /// Timestamp of the earliest pending entry, if any.
    pub fn next_expiration(&self) -> Result<Option<i64>> {
        let mut scan = self.store().snapshot().scan(KS_EXPIRY);
        scan.seek_to_first();
        match scan.entry()? {
            Some((key, _)) => Ok(Some(ExpiryEntry::decode(key)?.timestamp)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ExpiryEnumerator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryEnumerator")
            .field("now", &self.now)
            .field("open", &self.scan.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_by_timestamp_then_doc() {
        let mut keys = vec![
            expiry_key(200, b"a"),
            expiry_key(-5, b"z"),
            expiry_key(100, b"b"),
            expiry_key(100, b"a"),
        ];
        keys.sort();
        let decoded: Vec<(i64, Vec<u8>)> = keys
            .iter()
            .map(|k| {
                let e = ExpiryEntry::decode(k).unwrap();
                (e.timestamp, e.doc_id)
            })
            .collect();
        assert_eq!(
            decoded,
            vec![
                (-5, b"z".to_vec()),
                (100, b"a".to_vec()),
                (100, b"b".to_vec()),
                (200, b"a".to_vec()),
            ]
        );
    }

    #[test]
    fn test_end_key_bounds_due_entries() {
        let bound = end_key(150);
        assert!(expiry_key(150, b"\xff\xff").as_slice() < bound.as_slice());
        assert!(expiry_key(150, b"").as_slice() < bound.as_slice());
        assert!(expiry_key(151, b"").as_slice() > bound.as_slice());
    }
}
