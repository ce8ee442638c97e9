//! Ordered enumeration of documents by ID ("all docs") or by sequence
//! ("changes").
//!
//! Every enumerator reads one RocksDB snapshot taken at construction, so it
//! never observes commits made while it runs, nor writes staged in an open
//! transaction. Skipping and range checks run on raw keys; a document is
//! only decoded once it is going to be returned.

use crate::database::{decode_sequence, Database};
use crate::document::{Document, DocumentFlags, DocumentMeta};
use crate::error::Result;
use crate::storage::record::{ContentOptions, Record};
use crate::storage::rocks::{Scan, KS_DOCUMENTS, KS_SEQUENCES};

/// Enumeration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratorOptions {
    /// Matching documents to pass over before the first one returned
    pub skip: usize,
    /// Stop after this many documents
    pub limit: Option<usize>,
    /// Walk keys from high to low
    pub descending: bool,
    /// Include a document whose key equals the start bound (default: true)
    pub inclusive_start: bool,
    /// Include a document whose key equals the end bound (default: true).
    /// Always true for changes.
    pub inclusive_end: bool,
    /// Return deleted documents too (default: false)
    pub include_deleted: bool,
    /// How much of each document to load (default: full)
    pub content: ContentOptions,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: None,
            descending: false,
            inclusive_start: true,
            inclusive_end: true,
            include_deleted: false,
            content: ContentOptions::Full,
        }
    }
}

#[derive(Debug)]
enum Range {
    /// `start`/`end` are the first and last keys visited, so when
    /// descending `start` is the high key.
    ById {
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    },
    /// `(since, end]`
    BySequence { since: u64, end: Option<u64> },
}

/// Lazy, forward-only document iterator. Exhaustion is `None`, never an
/// error; a failed step yields one `Err` and then ends.
pub struct DocEnumerator<'a> {
    scan: Scan<'a>,
    range: Range,
    options: EnumeratorOptions,
    skip_remaining: usize,
    positioned: bool,
    returned: usize,
    done: bool,
}

impl<'a> DocEnumerator<'a> {
    fn new(db: &'a Database, range: Range, options: EnumeratorOptions) -> Self {
        let keyspace = match range {
            Range::ById { .. } => KS_DOCUMENTS,
            Range::BySequence { .. } => KS_SEQUENCES,
        };
        Self {
            scan: db.store().snapshot().scan(keyspace),
            skip_remaining: options.skip,
            range,
            options,
            positioned: false,
            returned: 0,
            done: false,
        }
    }

    fn position(&mut self) {
        let descending = self.options.descending;
        match &self.range {
            Range::ById { start, .. } => match (start, descending) {
                (Some(start), false) => self.scan.seek(start),
                (Some(start), true) => self.scan.seek_for_prev(start),
                (None, false) => self.scan.seek_to_first(),
                (None, true) => self.scan.seek_to_last(),
            },
            Range::BySequence { since, end } => match (descending, end) {
                (false, _) => match since.checked_add(1) {
                    Some(first) => self.scan.seek(&first.to_be_bytes()),
                    None => self.done = true,
                },
                (true, Some(end)) => self.scan.seek_for_prev(&end.to_be_bytes()),
                (true, None) => self.scan.seek_to_last(),
            },
        }
    }

    fn advance(&mut self) {
        if self.options.descending {
            self.scan.prev();
        } else {
            self.scan.next();
        }
    }

    /// `Some(false)` to pass over the key, `None` once past the range.
    fn in_range(&self, key: &[u8]) -> Option<bool> {
        let descending = self.options.descending;
        match &self.range {
            Range::ById { start, end } => {
                if let Some(end) = end {
                    let past = if descending { key < end.as_slice() } else { key > end.as_slice() };
                    if past || (key == end.as_slice() && !self.options.inclusive_end) {
                        return None;
                    }
                }
                let at_start = start.as_deref() == Some(key);
                Some(!(at_start && !self.options.inclusive_start))
            }
            Range::BySequence { since, end } => {
                let sequence = decode_sequence(key)?;
                if sequence <= *since || end.is_some_and(|end| sequence > end) {
                    return None;
                }
                Some(true)
            }
        }
    }

    fn step(&mut self) -> Result<Option<Document>> {
        loop {
            if self.done || self.options.limit.is_some_and(|limit| self.returned >= limit) {
                return Ok(None);
            }
            if self.positioned {
                self.advance();
            } else {
                self.positioned = true;
                self.position();
                if self.done {
                    return Ok(None);
                }
            }

            let Some((key, value)) = self.scan.entry()? else {
                return Ok(None);
            };
            match self.in_range(key) {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(false) => continue,
                Some(true) => {}
            }

            let (doc_id, record) = match self.range {
                Range::ById { .. } => (key.to_vec(), value.to_vec()),
                Range::BySequence { .. } => {
                    let sequence = decode_sequence(key).unwrap_or_default();
                    let doc_id = value.to_vec();
                    match self.scan.snapshot().get(KS_DOCUMENTS, &doc_id)? {
                        Some(record) if Record::decode_header(&record)?.0.sequence == sequence => {
                            (doc_id, record)
                        }
                        _ => {
                            log::warn!(
                                "Stale change-index entry at sequence {sequence} for '{}'",
                                String::from_utf8_lossy(&doc_id)
                            );
                            continue;
                        }
                    }
                }
            };

            if !self.options.include_deleted {
                let (header, _) = Record::decode_header(&record)?;
                if DocumentMeta::decode(&header.meta)?
                    .flags()
                    .contains(DocumentFlags::DELETED)
                {
                    continue;
                }
            }
            if self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }

            let doc = Document::from_record(&doc_id, Record::decode(&record, self.options.content)?)?;
            self.returned += 1;
            return Ok(Some(doc));
        }
    }
}

impl Iterator for DocEnumerator<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(doc)) => Some(Ok(doc)),
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
    /// Documents with IDs between `start` and `end`, in ID order.
    ///
    /// Either bound may be open. When `descending`, `start` is the high key
    /// and enumeration runs down to `end`.
    pub fn enumerate_all_docs(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: EnumeratorOptions,
    ) -> DocEnumerator<'_> {
        let range = Range::ById {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
        };
        DocEnumerator::new(self, range, options)
    }

    /// Live documents changed after sequence `since`, in sequence order.
    pub fn enumerate_changes(&self, since: u64, with_bodies: bool) -> DocEnumerator<'_> {
        let options = EnumeratorOptions {
            content: if with_bodies {
                ContentOptions::Full
            } else {
                ContentOptions::MetaOnly
            },
            ..Default::default()
        };
        self.enumerate_changes_with(since, None, options)
    }

    /// Documents whose latest save falls in `(since, end]`.
    pub fn enumerate_changes_with(
        &self,
        since: u64,
        end: Option<u64>,
        mut options: EnumeratorOptions,
    ) -> DocEnumerator<'_> {
        options.inclusive_end = true;
        DocEnumerator::new(self, Range::BySequence { since, end }, options)
    }
}
