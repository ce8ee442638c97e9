//! The database handle: transactions, document load/save, purge and
//! maintenance.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::document::{flags_for, Document, DocumentMeta};
use crate::error::{Result, StoreError};
use crate::revision::{Body, RevId};
use crate::storage::collatable::CollatableBuilder;
use crate::storage::record::{ContentOptions, Record};
use crate::storage::rocks::{
    KeyValueStore, StoreConfig, KS_BODIES, KS_DOCUMENTS, KS_EXPIRY, KS_SEQUENCES,
};
use crate::storage::transaction::{TransactionController, TransactionEnd, WriteSet};

/// Key in `sequences` holding the highest sequence ever committed. Sorts
/// before every 8-byte sequence key, so scans never reach it.
const SEQUENCE_COUNTER_KEY: &[u8] = b"";

/// Key of an archived body: `[doc_id, rev_id, sequence]`.
pub(crate) fn body_key(doc_id: &[u8], rev_id: &RevId, sequence: u64) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array()
        .add_bytes(doc_id)
        .add_string(&rev_id.to_string())
        .add_int(sequence as i64)
        .end_array();
    key.into_bytes()
}

/// Prefix shared by every archived body of one document.
fn body_prefix(doc_id: &[u8]) -> Vec<u8> {
    let mut key = CollatableBuilder::new();
    key.begin_array().add_bytes(doc_id);
    key.into_bytes()
}

pub(crate) fn decode_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn doc_label(doc_id: &[u8]) -> String {
    String::from_utf8_lossy(doc_id).into_owned()
}

/// An open document database.
///
/// All methods take `&self`. Writes are staged in the handle's transaction
/// and become visible to other readers only when the outermost
/// [`end_transaction`](Database::end_transaction) commits; this handle's
/// own point reads see them immediately.
pub struct Database {
    store: KeyValueStore,
    txn: Mutex<TransactionController>,
    /// Highest committed sequence.
    last_sequence: AtomicU64,
}

impl Database {
    /// Open (or create) the database described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let store = KeyValueStore::open(config)?;

        let from_index = match store.last_key(KS_SEQUENCES)? {
            Some(key) => decode_sequence(&key).unwrap_or(0),
            None => 0,
        };
        let from_counter = store
            .get(KS_SEQUENCES, SEQUENCE_COUNTER_KEY)?
            .and_then(|bytes| decode_sequence(&bytes))
            .unwrap_or(0);
        let last_sequence = from_index.max(from_counter);

        log::debug!(
            "Opened database at {} (last sequence {last_sequence})",
            store.path().display()
        );

        Ok(Self {
            store,
            txn: Mutex::new(TransactionController::new()),
            last_sequence: AtomicU64::new(last_sequence),
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn config(&self) -> &StoreConfig {
        self.store.config()
    }

    /// Highest sequence assigned by a committed save.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Number of existing, non-deleted documents (committed state).
    pub fn document_count(&self) -> Result<u64> {
        let options = crate::EnumeratorOptions {
            content: ContentOptions::MetaOnly,
            include_deleted: false,
            ..Default::default()
        };
        let mut count = 0;
        for doc in self.enumerate_all_docs(None, None, options) {
            doc?;
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn store(&self) -> &KeyValueStore {
        &self.store
    }

    fn controller(&self) -> Result<MutexGuard<'_, TransactionController>> {
        self.txn
            .lock()
            .map_err(|_| StoreError::Internal("transaction state lock poisoned".into()))
    }

    // ─── Transactions ─────────────────────────────────────────────────

    pub fn is_in_transaction(&self) -> Result<bool> {
        Ok(self.controller()?.is_active())
    }

    /// Open a transaction level. Only the outermost level opens a new
    /// write set; inner levels share it.
    pub fn begin_transaction(&self) -> Result<()> {
        if self.store.config().read_only {
            return Err(StoreError::Precondition("database is read-only".into()));
        }
        let mut ctl = self.controller()?;
        if ctl.begin(self.last_sequence()) {
            log::debug!("Began transaction on {}", self.store.path().display());
        }
        Ok(())
    }

    /// Close a transaction level. The outermost close writes every staged
    /// write in one batch (`commit`) or discards them.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut ctl = self.controller()?;
        match ctl.end(commit)? {
            TransactionEnd::Nested => Ok(()),
            TransactionEnd::Commit(open) => {
                let last = open.last_sequence();
                let mut writes = open.into_writes();
                if last > self.last_sequence() {
                    writes.put(KS_SEQUENCES, SEQUENCE_COUNTER_KEY, last.to_be_bytes());
                }
                self.store.write(&writes)?;
                self.last_sequence.store(last, Ordering::Release);
                log::debug!("Committed {} writes (last sequence {last})", writes.len());
                Ok(())
            }
            TransactionEnd::Abort(open) => {
                log::debug!("Aborted transaction, discarded {} writes", open.writes().len());
                Ok(())
            }
        }
    }

    /// Point read through the open transaction's staged writes.
    pub(crate) fn read(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let ctl = self.controller()?;
        self.read_through(ctl.pending(), keyspace, key)
    }

    fn read_through(
        &self,
        pending: Option<&WriteSet>,
        keyspace: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = pending.and_then(|writes| writes.get(keyspace, key)) {
            return Ok(staged.map(<[u8]>::to_vec));
        }
        self.store.get(keyspace, key)
    }

    /// Merge a unit of work into the open transaction.
    pub(crate) fn apply(&self, writes: WriteSet) -> Result<()> {
        let mut ctl = self.controller()?;
        ctl.open_mut()?.apply(writes, false);
        Ok(())
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Load a document with its full revision tree.
    ///
    /// An absent document comes back empty (`exists() == false`) unless
    /// `must_exist` is set, in which case it is `NotFound`.
    pub fn get_document(&self, doc_id: &[u8], must_exist: bool) -> Result<Document> {
        self.get_document_with(doc_id, must_exist, ContentOptions::Full)
    }

    pub fn get_document_with(
        &self,
        doc_id: &[u8],
        must_exist: bool,
        content: ContentOptions,
    ) -> Result<Document> {
        if doc_id.is_empty() {
            return Err(StoreError::BadRequest("empty document ID".into()));
        }
        match self.read(KS_DOCUMENTS, doc_id)? {
            Some(bytes) => Document::from_record(doc_id, Record::decode(&bytes, content)?),
            None if must_exist => Err(StoreError::NotFound(format!(
                "document '{}'",
                doc_label(doc_id)
            ))),
            None => Ok(Document::new(doc_id)),
        }
    }

    /// Upgrade a metadata-only document to one with its revision tree.
    pub fn load_revisions(&self, doc: &mut Document) -> Result<()> {
        if doc.revisions_loaded() {
            return Ok(());
        }
        let tree = match self.read(KS_DOCUMENTS, doc.doc_id())? {
            Some(bytes) => {
                let record = Record::decode(&bytes, ContentOptions::Full)?;
                crate::revision::RevTree::decode(record.body.as_deref().unwrap_or_default())?
            }
            None => crate::revision::RevTree::new(),
        };
        doc.attach_tree(tree);
        Ok(())
    }

    /// Make the selected revision's body available through
    /// [`Document::selected_body`], fetching it from the archive if needed.
    ///
    /// `Gone` if the body was compacted away or never stored here.
    pub fn load_revision_body(&self, doc: &mut Document) -> Result<()> {
        let rev = doc.selected_revision().ok_or_else(|| {
            StoreError::NotFound(format!("no revision selected in '{}'", doc_label(doc.doc_id())))
        })?;
        let key = match rev.body() {
            Body::Inline(_) => return Ok(()),
            Body::Missing => {
                return Err(StoreError::Gone(format!(
                    "{} of '{}' has no stored body",
                    rev.rev_id(),
                    doc_label(doc.doc_id())
                )))
            }
            Body::External => body_key(doc.doc_id(), rev.rev_id(), rev.sequence()),
        };
        let gone = || {
            StoreError::Gone(format!(
                "archived body of {} in '{}'",
                rev.rev_id(),
                doc_label(doc.doc_id())
            ))
        };
        let bytes = self.read(KS_BODIES, &key)?.ok_or_else(gone)?;
        let body = Record::decode(&bytes, ContentOptions::Full)?
            .body
            .ok_or_else(gone)?;
        doc.set_loaded_body(body);
        Ok(())
    }

    /// Select `rev_id` and, if `with_body`, load its body.
    pub fn select_revision(&self, doc: &mut Document, rev_id: &str, with_body: bool) -> Result<()> {
        doc.select_revision(rev_id)?;
        if with_body {
            self.load_revision_body(doc)?;
        }
        Ok(())
    }

    /// Prune to `max_depth` and stage the document in the open transaction.
    ///
    /// The document receives the next sequence. Bodies of revisions that are
    /// no longer leaves move to the archive. A document with nothing new to
    /// write is left alone.
    pub fn save_document(&self, doc: &mut Document, max_depth: u32) -> Result<()> {
        let mut ctl = self.controller()?;
        let open = ctl.open_mut()?;

        if !doc.revisions_loaded() {
            return Err(StoreError::Precondition(format!(
                "'{}' was loaded without revisions",
                doc_label(doc.doc_id())
            )));
        }

        self.settle_unconfirmed_save(doc, open.writes())?;

        let mut tree = doc.tree().clone();
        tree.prune(max_depth);
        if !tree.is_changed() && !doc.meta_changed() {
            return Ok(());
        }
        if tree.is_empty() {
            return Err(StoreError::BadRequest(format!(
                "'{}' has no revisions to save",
                doc_label(doc.doc_id())
            )));
        }

        let compress = self.store.config().compress_bodies;
        let doc_id = doc.doc_id();
        let sequence = open.peek_sequence();
        tree.assign_sequence(sequence);

        let mut writes = WriteSet::default();
        let archived = tree.archive_interior_bodies();
        for (rev_id, rev_seq, body) in &archived {
            writes.put(
                KS_BODIES,
                body_key(doc_id, rev_id, *rev_seq),
                Record::encode(*rev_seq, &[], body, compress)?,
            );
        }
        let orphaned = tree.take_orphaned_bodies();
        for (rev_id, rev_seq) in &orphaned {
            writes.delete(KS_BODIES, body_key(doc_id, rev_id, *rev_seq));
        }

        let previous = self.read_through(Some(open.writes()), KS_DOCUMENTS, doc_id)?;
        if let Some(bytes) = previous {
            let (header, _) = Record::decode_header(&bytes)?;
            writes.delete(KS_SEQUENCES, header.sequence.to_be_bytes());
        }

        let meta = DocumentMeta {
            flags: flags_for(&tree).bits(),
            rev_id: tree.current().map(|rev| rev.rev_id().to_string()),
            doc_type: doc.doc_type().map(str::to_string),
        };
        writes.put(
            KS_DOCUMENTS,
            doc_id,
            Record::encode(sequence, &meta.encode()?, &tree.encode()?, compress)?,
        );
        writes.put(KS_SEQUENCES, sequence.to_be_bytes(), doc_id);

        open.apply(writes, true);
        tree.mark_saved();
        log::trace!(
            "Saved '{}' at sequence {sequence} ({} revisions)",
            doc_label(doc_id),
            tree.len()
        );
        doc.commit_save(tree, sequence, archived, orphaned);
        Ok(())
    }

    /// Reconcile a document with the fate of its previous save.
    ///
    /// On disk at the saved sequence means committed; still in `staged`
    /// means the transaction is open; anything else means it was rolled
    /// back and the document must be written again.
    fn settle_unconfirmed_save(&self, doc: &mut Document, staged: &WriteSet) -> Result<()> {
        let Some(sequence) = doc.unconfirmed_sequence() else {
            return Ok(());
        };
        let stored_sequence = |bytes: Option<Vec<u8>>| -> Result<Option<u64>> {
            bytes
                .map(|bytes| Record::decode_header(&bytes).map(|(header, _)| header.sequence))
                .transpose()
        };

        let doc_id = doc.doc_id().to_vec();
        if stored_sequence(self.store.get(KS_DOCUMENTS, &doc_id)?)? == Some(sequence) {
            doc.confirm_save();
        } else if stored_sequence(self.read_through(Some(staged), KS_DOCUMENTS, &doc_id)?)?
            != Some(sequence)
        {
            log::debug!(
                "Save of '{}' at sequence {sequence} was rolled back; writing it again",
                doc_label(&doc_id)
            );
            doc.revert_save();
        }
        Ok(())
    }

    /// [`save_document`](Database::save_document) with the configured depth.
    pub fn save_document_default(&self, doc: &mut Document) -> Result<()> {
        self.save_document(doc, self.store.config().default_max_rev_tree_depth)
    }

    /// Remove a document outright: record, change-index entry and archived
    /// bodies. Returns false if it did not exist.
    pub fn purge_document(&self, doc_id: &[u8]) -> Result<bool> {
        let mut writes = WriteSet::default();
        if !self.stage_purge(doc_id, &mut writes)? {
            return Ok(false);
        }
        self.apply(writes)?;
        log::trace!("Purged '{}'", doc_label(doc_id));
        Ok(true)
    }

    /// Stage the deletes that purge `doc_id` into `writes`.
    pub(crate) fn stage_purge(&self, doc_id: &[u8], writes: &mut WriteSet) -> Result<bool> {
        let ctl = self.controller()?;
        if !ctl.is_active() {
            return Err(StoreError::Precondition("purge requires an open transaction".into()));
        }
        let pending = ctl.pending();

        let Some(bytes) = self.read_through(pending, KS_DOCUMENTS, doc_id)? else {
            return Ok(false);
        };
        let (header, _) = Record::decode_header(&bytes)?;
        writes.delete(KS_DOCUMENTS, doc_id);
        writes.delete(KS_SEQUENCES, header.sequence.to_be_bytes());

        let prefix = body_prefix(doc_id);
        let mut scan = self.store.snapshot().scan(KS_BODIES);
        scan.seek(&prefix);
        while let Some((key, _)) = scan.entry()? {
            if !key.starts_with(&prefix) {
                break;
            }
            writes.delete(KS_BODIES, key.to_vec());
            scan.next();
        }
        if let Some(pending) = pending {
            for key in pending.keys_with_prefix(KS_BODIES, &prefix) {
                writes.delete(KS_BODIES, key);
            }
        }
        Ok(true)
    }

    // ─── Expiration ───────────────────────────────────────────────────

    /// Schedule `doc_id` for purging once `timestamp` (seconds since the
    /// Unix epoch) has passed. Requires an open transaction.
    pub fn set_expiration(&self, doc_id: &[u8], timestamp: i64) -> Result<()> {
        if doc_id.is_empty() {
            return Err(StoreError::BadRequest("empty document ID".into()));
        }
        let mut writes = WriteSet::default();
        writes.put(KS_EXPIRY, crate::expiry::expiry_key(timestamp, doc_id), Vec::new());
        self.apply(writes)
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Drop every archived body and compact all keyspaces. Afterwards only
    /// leaf revisions still have bodies.
    pub fn compact(&self) -> Result<()> {
        if self.store.config().read_only {
            return Err(StoreError::Precondition("database is read-only".into()));
        }
        if self.is_in_transaction()? {
            return Err(StoreError::Precondition(
                "cannot compact inside a transaction".into(),
            ));
        }

        let mut writes = WriteSet::default();
        let mut scan = self.store.snapshot().scan(KS_BODIES);
        scan.seek_to_first();
        while let Some((key, _)) = scan.entry()? {
            writes.delete(KS_BODIES, key.to_vec());
            scan.next();
        }
        drop(scan);

        let dropped = writes.len();
        self.store.write(&writes)?;
        self.store.compact_all()?;
        log::info!(
            "Compacted {}: dropped {dropped} archived bodies",
            self.store.path().display()
        );
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let depth = self.txn.get_mut().map(|ctl| ctl.depth()).unwrap_or(0);
        if depth > 0 {
            log::error!(
                "Database at {} closed inside a transaction (depth {depth}); staged writes discarded",
                self.store.path().display()
            );
            debug_assert!(
                std::thread::panicking(),
                "Database dropped with an open transaction"
            );
        }
    }
}
