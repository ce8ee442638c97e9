//! A loaded document: metadata plus (optionally) its full revision tree and
//! a cursor selecting one revision.
//!
//! Documents are plain values. Reading and writing them goes through
//! [`Database`](crate::Database); everything here is in-memory.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::revision::{RevId, RevTree, Revision};
use crate::storage::record::Record;

bitflags::bitflags! {
    /// Document-level flags, derived from the revision tree on every change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DocumentFlags: u8 {
        const DELETED = 0x01;
        const CONFLICTED = 0x02;
        const HAS_ATTACHMENTS = 0x04;
        const EXISTS = 0x08;
    }
}

/// Metadata kept in the record header, readable without the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DocumentMeta {
    pub flags: u8,
    pub rev_id: Option<String>,
    pub doc_type: Option<String>,
}

impl DocumentMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Internal(format!("document meta encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::corrupt("document meta", e))?;
        Ok(meta)
    }

    pub fn flags(&self) -> DocumentFlags {
        DocumentFlags::from_bits_truncate(self.flags)
    }
}

/// Flags a document with this tree would carry.
pub(crate) fn flags_for(tree: &RevTree) -> DocumentFlags {
    let mut flags = DocumentFlags::empty();
    if let Some(current) = tree.current() {
        flags |= DocumentFlags::EXISTS;
        flags.set(DocumentFlags::DELETED, current.is_deleted());
        flags.set(DocumentFlags::HAS_ATTACHMENTS, current.has_attachments());
    }
    flags.set(DocumentFlags::CONFLICTED, tree.has_conflicts());
    flags
}

#[derive(Debug, Clone)]
pub struct Document {
    doc_id: Vec<u8>,
    rev_id: Option<RevId>,
    flags: DocumentFlags,
    sequence: u64,
    doc_type: Option<String>,
    tree: RevTree,
    revisions_loaded: bool,
    meta_changed: bool,
    selected: Option<RevId>,
    /// Body fetched from the archive for the selected revision.
    loaded_body: Option<Vec<u8>>,
    /// Saves staged but not yet seen on disk.
    unconfirmed: Option<UnconfirmedSave>,
}

/// What a staged save changed in memory, kept until the write is confirmed
/// so an aborted transaction can be undone on the next save.
#[derive(Debug, Clone, Default)]
struct UnconfirmedSave {
    sequences: Vec<u64>,
    prior_sequence: u64,
    meta_changed: bool,
    archived: Vec<(RevId, u64, Vec<u8>)>,
    orphaned: Vec<(RevId, u64)>,
}

impl Document {
    /// A document that has never been saved.
    pub(crate) fn new(doc_id: &[u8]) -> Self {
        Self {
            doc_id: doc_id.to_vec(),
            rev_id: None,
            flags: DocumentFlags::empty(),
            sequence: 0,
            doc_type: None,
            tree: RevTree::new(),
            revisions_loaded: true,
            meta_changed: false,
            selected: None,
            loaded_body: None,
            unconfirmed: None,
        }
    }

    /// Rebuild from a stored record; the tree is decoded only when the
    /// record carries its body.
    pub(crate) fn from_record(doc_id: &[u8], record: Record) -> Result<Self> {
        let meta = DocumentMeta::decode(&record.meta)?;
        let rev_id = meta.rev_id.as_deref().map(str::parse::<RevId>).transpose()?;
        let mut doc = Self {
            doc_id: doc_id.to_vec(),
            rev_id,
            flags: meta.flags(),
            sequence: record.sequence,
            doc_type: meta.doc_type,
            tree: RevTree::new(),
            revisions_loaded: false,
            meta_changed: false,
            selected: None,
            loaded_body: None,
            unconfirmed: None,
        };
        if let Some(body) = record.body {
            doc.attach_tree(RevTree::decode(&body)?);
        }
        Ok(doc)
    }

    pub(crate) fn attach_tree(&mut self, tree: RevTree) {
        self.tree = tree;
        self.revisions_loaded = true;
        self.refresh();
        self.selected = self.rev_id.clone();
        self.loaded_body = None;
    }

    pub(crate) fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            flags: self.flags.bits(),
            rev_id: self.rev_id.as_ref().map(RevId::to_string),
            doc_type: self.doc_type.clone(),
        }
    }

    pub(crate) fn meta_changed(&self) -> bool {
        self.meta_changed
    }

    pub(crate) fn tree(&self) -> &RevTree {
        &self.tree
    }

    /// Install the tree that was just staged at `sequence`.
    ///
    /// `archived` and `orphaned` are the archive writes the save staged;
    /// they are kept until [`confirm_save`](Self::confirm_save) or
    /// [`revert_save`](Self::revert_save).
    pub(crate) fn commit_save(
        &mut self,
        tree: RevTree,
        sequence: u64,
        archived: Vec<(RevId, u64, Vec<u8>)>,
        orphaned: Vec<(RevId, u64)>,
    ) {
        let prior_sequence = self.sequence;
        let meta_changed = self.meta_changed;
        let save = self.unconfirmed.get_or_insert_with(|| UnconfirmedSave {
            prior_sequence,
            meta_changed,
            ..Default::default()
        });
        save.sequences.push(sequence);
        save.archived.extend(archived);
        save.orphaned.extend(orphaned);

        self.tree = tree;
        self.sequence = sequence;
        self.meta_changed = false;
        if self.selected.as_ref().is_some_and(|id| !self.tree.contains(id)) {
            self.selected = None;
            self.loaded_body = None;
        }
        self.refresh();
    }

    /// Sequence of the last save if it has not been seen on disk yet.
    pub(crate) fn unconfirmed_sequence(&self) -> Option<u64> {
        self.unconfirmed.as_ref().map(|_| self.sequence)
    }

    pub(crate) fn confirm_save(&mut self) {
        self.unconfirmed = None;
    }

    /// The staged saves were discarded: mark everything they wrote as
    /// unsaved again. Revisions inserted since are kept.
    pub(crate) fn revert_save(&mut self) {
        let Some(save) = self.unconfirmed.take() else {
            return;
        };
        self.tree
            .restore_unsaved(&save.sequences, save.archived, save.orphaned);
        self.sequence = save.prior_sequence;
        self.meta_changed |= save.meta_changed;
        self.refresh();
    }

    pub(crate) fn set_loaded_body(&mut self, body: Vec<u8>) {
        self.loaded_body = Some(body);
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.doc_id
    }

    /// ID of the current revision, if the document exists.
    pub fn rev_id(&self) -> Option<&RevId> {
        self.rev_id.as_ref()
    }

    pub fn flags(&self) -> DocumentFlags {
        self.flags
    }

    pub fn exists(&self) -> bool {
        self.flags.contains(DocumentFlags::EXISTS)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DocumentFlags::DELETED)
    }

    pub fn has_conflicts(&self) -> bool {
        self.flags.contains(DocumentFlags::CONFLICTED)
    }

    pub fn has_attachments(&self) -> bool {
        self.flags.contains(DocumentFlags::HAS_ATTACHMENTS)
    }

    /// Sequence of the last save; 0 if never saved.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    /// Stored with the document on the next save.
    pub fn set_doc_type(&mut self, doc_type: Option<&str>) {
        let doc_type = doc_type.map(str::to_string);
        if doc_type != self.doc_type {
            self.doc_type = doc_type;
            self.meta_changed = true;
        }
    }

    /// False for documents read metadata-only.
    pub fn revisions_loaded(&self) -> bool {
        self.revisions_loaded
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.tree.iter()
    }

    pub fn revision_count(&self) -> usize {
        self.tree.len()
    }

    // ─── Selection ───────────────────────────────────────────────────

    pub fn selected_revision(&self) -> Option<&Revision> {
        self.selected.as_ref().and_then(|id| self.tree.get(id))
    }

    /// Body of the selected revision, inline or fetched from the archive.
    pub fn selected_body(&self) -> Option<&[u8]> {
        let rev = self.selected_revision()?;
        rev.inline_body().or(self.loaded_body.as_deref())
    }

    pub fn select_current_revision(&mut self) -> Result<()> {
        let current = self.tree.current().map(|rev| rev.rev_id().clone());
        self.select(current, "current revision")
    }

    pub fn select_revision(&mut self, rev_id: &str) -> Result<()> {
        let rev_id: RevId = rev_id.parse()?;
        let found = self.tree.contains(&rev_id).then_some(rev_id);
        self.select(found, "revision")
    }

    pub fn select_parent_revision(&mut self) -> Result<()> {
        let parent = self
            .selected_revision()
            .and_then(|rev| rev.parent())
            .cloned();
        self.select(parent, "parent revision")
    }

    /// Step to the next revision in traversal order (current first).
    pub fn select_next_revision(&mut self) -> Result<()> {
        let next = self
            .selected
            .as_ref()
            .and_then(|id| self.tree.next_after(id))
            .map(|rev| rev.rev_id().clone());
        self.select(next, "next revision")
    }

    pub fn select_next_leaf_revision(&mut self, include_deleted: bool) -> Result<()> {
        let mut cursor = self.selected.clone();
        let next = loop {
            let Some(id) = cursor else { break None };
            match self.tree.next_after(&id) {
                Some(rev) if rev.is_leaf() && (include_deleted || !rev.is_deleted()) => {
                    break Some(rev.rev_id().clone());
                }
                Some(rev) => cursor = Some(rev.rev_id().clone()),
                None => break None,
            }
        };
        self.select(next, "next leaf revision")
    }

    fn select(&mut self, target: Option<RevId>, what: &str) -> Result<()> {
        self.loaded_body = None;
        self.selected = target;
        if self.selected.is_some() {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!(
                "{what} of '{}'",
                String::from_utf8_lossy(&self.doc_id)
            )))
        }
    }

    // ─── Mutation ────────────────────────────────────────────────────

    /// Add a child of the selected revision (or a root if nothing is
    /// selected) and select it.
    ///
    /// Returns `Ok(false)` if the revision already exists.
    pub fn insert_revision(
        &mut self,
        rev_id: &str,
        body: &[u8],
        deleted: bool,
        has_attachments: bool,
        allow_conflict: bool,
    ) -> Result<bool> {
        self.require_revisions()?;
        let rev_id: RevId = rev_id.parse()?;
        let parent = self.selected.clone();
        let inserted = self.tree.insert(
            rev_id.clone(),
            body.to_vec(),
            deleted,
            has_attachments,
            parent.as_ref(),
            allow_conflict,
        )?;
        if inserted {
            self.refresh();
            self.selected = Some(rev_id);
            self.loaded_body = None;
        }
        Ok(inserted)
    }

    /// Add a replicated revision with its ancestry, newest first, and
    /// select it. Returns the index of the common ancestor in `history`.
    pub fn insert_revision_with_history(
        &mut self,
        history: &[&str],
        body: &[u8],
        deleted: bool,
        has_attachments: bool,
    ) -> Result<Option<usize>> {
        self.require_revisions()?;
        let history: Vec<RevId> = history.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        let common = self
            .tree
            .insert_history(&history, body.to_vec(), deleted, has_attachments)?;
        self.refresh();
        self.selected = history.first().cloned();
        self.loaded_body = None;
        Ok(common)
    }

    /// Prune the in-memory tree; the next save persists it.
    pub fn prune(&mut self, max_depth: u32) -> usize {
        let removed = self.tree.prune(max_depth);
        if removed > 0 {
            if self.selected.as_ref().is_some_and(|id| !self.tree.contains(id)) {
                self.selected = None;
                self.loaded_body = None;
            }
            self.refresh();
        }
        removed
    }

    fn require_revisions(&self) -> Result<()> {
        if self.revisions_loaded {
            Ok(())
        } else {
            Err(StoreError::Precondition(
                "document was loaded without revisions".into(),
            ))
        }
    }

    fn refresh(&mut self) {
        if self.revisions_loaded {
            self.flags = flags_for(&self.tree);
            self.rev_id = self.tree.current().map(|rev| rev.rev_id().clone());
        }
    }
}
