//! In-memory revision tree for a single document.
//!
//! ```text
//!        1-a
//!         │
//!        2-b ──────┐
//!         │        │
//!        3-c      3-x      two leaves → conflict; 3-x wins (x > c)
//! ```
//!
//! Nodes live in an arena keyed by [`RevId`]; a node's parent is another key
//! in the same arena, never a reference. Pruning drops keys and clears the
//! parent of any survivor whose parent went away.
//!
//! Traversal order (`order`) puts the current revision first, then other
//! leaves, then interior nodes: leaves before non-leaves, live before
//! deleted, higher revision ID before lower.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::revid::RevId;
use crate::error::{Result, StoreError};

bitflags::bitflags! {
    /// Per-revision flags. `LEAF` is derived from tree shape.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RevisionFlags: u8 {
        const DELETED = 0x01;
        const LEAF = 0x02;
        const HAS_ATTACHMENTS = 0x04;
    }
}

/// Where a revision's body lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Stored inside the encoded tree.
    Inline(Vec<u8>),
    /// Archived in the bodies keyspace under `(doc_id, rev_id, sequence)`.
    External,
    /// Never had a body here (ancestor created from replicated history).
    Missing,
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    rev_id: RevId,
    parent: Option<RevId>,
    flags: RevisionFlags,
    sequence: u64,
    body: Body,
}

impl Revision {
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    pub fn parent(&self) -> Option<&RevId> {
        self.parent.as_ref()
    }

    pub fn flags(&self) -> RevisionFlags {
        self.flags
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevisionFlags::LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevisionFlags::DELETED)
    }

    pub fn has_attachments(&self) -> bool {
        self.flags.contains(RevisionFlags::HAS_ATTACHMENTS)
    }

    /// Document sequence at which this revision was first saved; 0 if unsaved.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn inline_body(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Sort key for traversal order; greater sorts first.
    fn priority(&self) -> (bool, bool, &RevId) {
        (self.is_leaf(), !self.is_deleted(), &self.rev_id)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRevision {
    rev_id: String,
    parent: Option<u32>,
    flags: u8,
    sequence: u64,
    body: Body,
}

/// The full revision history of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevTree {
    revs: BTreeMap<RevId, Revision>,
    order: Vec<RevId>,
    changed: bool,
    /// Archived bodies whose revisions were pruned since the last save.
    orphaned_bodies: Vec<(RevId, u64)>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// True when the tree differs from what was last loaded or saved.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn get(&self, rev_id: &RevId) -> Option<&Revision> {
        self.revs.get(rev_id)
    }

    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.revs.contains_key(rev_id)
    }

    /// The winning leaf: highest live leaf, or highest leaf if all are deleted.
    pub fn current(&self) -> Option<&Revision> {
        self.order.first().and_then(|id| self.revs.get(id))
    }

    /// All revisions in traversal order.
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.order.iter().filter_map(move |id| self.revs.get(id))
    }

    /// The revision after `rev_id` in traversal order.
    pub fn next_after(&self, rev_id: &RevId) -> Option<&Revision> {
        let pos = self.order.iter().position(|id| id == rev_id)?;
        self.order.get(pos + 1).and_then(|id| self.revs.get(id))
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Revision> {
        self.iter().filter(|rev| rev.is_leaf())
    }

    /// More than one leaf is still live.
    pub fn has_conflicts(&self) -> bool {
        self.leaves().filter(|rev| !rev.is_deleted()).nth(1).is_some()
    }

    /// Add a revision as a child of `parent` (or as a root).
    ///
    /// Returns `Ok(false)` without touching the tree if `rev_id` is already
    /// present. Fails with `Conflict` when `parent` is no longer a leaf (or a
    /// second root is attempted) and `allow_conflict` is false, and with
    /// `BadRequest` when the generation does not follow the parent's.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
        parent: Option<&RevId>,
        allow_conflict: bool,
    ) -> Result<bool> {
        if self.revs.contains_key(&rev_id) {
            return Ok(false);
        }

        let expected_generation = match parent {
            Some(parent_id) => {
                let parent = self
                    .revs
                    .get(parent_id)
                    .ok_or_else(|| StoreError::NotFound(format!("parent revision {parent_id}")))?;
                if !allow_conflict && !parent.is_leaf() {
                    return Err(StoreError::Conflict(format!(
                        "{parent_id} already has a child; cannot add {rev_id}"
                    )));
                }
                parent.rev_id.generation().checked_add(1)
            }
            None => {
                if !allow_conflict && !self.revs.is_empty() {
                    return Err(StoreError::Conflict(format!(
                        "document already has revisions; {rev_id} needs a parent"
                    )));
                }
                Some(1)
            }
        };
        if expected_generation != Some(rev_id.generation()) {
            return Err(StoreError::BadRequest(format!(
                "{rev_id} does not follow {}",
                parent.map_or_else(|| "the root".to_string(), |p| p.to_string())
            )));
        }

        self.add(rev_id, parent.cloned(), Body::Inline(body), deleted, has_attachments);
        self.reindex();
        Ok(true)
    }

    /// Add a replicated revision together with its ancestry.
    ///
    /// `history[0]` is the new revision, each following entry its parent.
    /// Returns the index of the first entry already in the tree, or `None`
    /// when the chain shares nothing with the stored history (it is then
    /// grafted in as an extra root).
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
    ) -> Result<Option<usize>> {
        if history.is_empty() {
            return Err(StoreError::BadRequest("empty revision history".into()));
        }

        let mut common_ancestor = None;
        for (i, rev_id) in history.iter().enumerate() {
            if i > 0 && rev_id.generation().checked_add(1) != Some(history[i - 1].generation()) {
                return Err(StoreError::BadRequest(format!(
                    "history is not consecutive: {} follows {}",
                    rev_id,
                    history[i - 1]
                )));
            }
            if self.revs.contains_key(rev_id) {
                common_ancestor = Some(i);
                break;
            }
        }

        let known = common_ancestor.unwrap_or(history.len());
        if known == 0 {
            return Ok(Some(0));
        }

        let mut parent = common_ancestor.map(|i| history[i].clone());
        for rev_id in history[1..known].iter().rev() {
            self.add(rev_id.clone(), parent.take(), Body::Missing, false, false);
            parent = Some(rev_id.clone());
        }
        self.add(history[0].clone(), parent, Body::Inline(body), deleted, has_attachments);
        self.reindex();
        Ok(common_ancestor)
    }

    /// Drop ancestors more than `max_depth` generations away from every leaf.
    ///
    /// A revision survives if it, or any of its ancestors, lies within
    /// `max_depth` of some leaf, so removal only ever trims whole roots and
    /// never splits a kept branch. `max_depth == 0` disables pruning.
    /// Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: u32) -> usize {
        if max_depth == 0 || self.revs.len() <= max_depth as usize {
            return 0;
        }

        let mut within_reach: HashSet<&RevId> = HashSet::new();
        for leaf in self.revs.values().filter(|rev| rev.is_leaf()) {
            let mut cursor = Some(&leaf.rev_id);
            let mut depth = 0;
            while let Some(id) = cursor {
                depth += 1;
                if depth > max_depth {
                    break;
                }
                within_reach.insert(id);
                cursor = self.revs.get(id).and_then(|rev| rev.parent.as_ref());
            }
        }

        let doomed: Vec<RevId> = self
            .revs
            .keys()
            .filter(|id| !self.self_or_ancestor_in(id, &within_reach))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        for id in &doomed {
            if let Some(rev) = self.revs.remove(id) {
                if rev.body == Body::External {
                    self.orphaned_bodies.push((rev.rev_id, rev.sequence));
                }
            }
        }
        let doomed: HashSet<RevId> = doomed.into_iter().collect();
        for rev in self.revs.values_mut() {
            if rev.parent.as_ref().is_some_and(|p| doomed.contains(p)) {
                rev.parent = None;
            }
        }

        self.changed = true;
        self.reindex();
        doomed.len()
    }

    fn self_or_ancestor_in(&self, id: &RevId, set: &HashSet<&RevId>) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if set.contains(current) {
                return true;
            }
            cursor = self.revs.get(current).and_then(|rev| rev.parent.as_ref());
        }
        false
    }

    // ─── Persistence support ─────────────────────────────────────────

    /// Stamp every unsaved revision with the sequence of the save in progress.
    pub(crate) fn assign_sequence(&mut self, sequence: u64) {
        for rev in self.revs.values_mut().filter(|rev| rev.sequence == 0) {
            rev.sequence = sequence;
        }
    }

    /// Move the bodies of interior revisions out of the tree.
    ///
    /// Returns `(rev_id, sequence, body)` for each body that must be written
    /// to the bodies keyspace; those revisions become [`Body::External`].
    pub(crate) fn archive_interior_bodies(&mut self) -> Vec<(RevId, u64, Vec<u8>)> {
        let mut archived = Vec::new();
        for rev in self.revs.values_mut().filter(|rev| !rev.is_leaf()) {
            if let Body::Inline(_) = rev.body {
                if let Body::Inline(bytes) = std::mem::replace(&mut rev.body, Body::External) {
                    archived.push((rev.rev_id.clone(), rev.sequence, bytes));
                }
            }
        }
        archived
    }

    pub(crate) fn take_orphaned_bodies(&mut self) -> Vec<(RevId, u64)> {
        std::mem::take(&mut self.orphaned_bodies)
    }

    pub(crate) fn mark_saved(&mut self) {
        self.changed = false;
    }

    /// Undo the in-memory effects of saves that never reached disk.
    ///
    /// Revisions stamped with one of `sequences` become unsaved again,
    /// archived bodies move back inline and orphaned archive entries are
    /// queued for deletion once more.
    pub(crate) fn restore_unsaved(
        &mut self,
        sequences: &[u64],
        archived: Vec<(RevId, u64, Vec<u8>)>,
        orphaned: Vec<(RevId, u64)>,
    ) {
        for rev in self.revs.values_mut().filter(|rev| sequences.contains(&rev.sequence)) {
            rev.sequence = 0;
        }
        for (rev_id, _, bytes) in archived {
            if let Some(rev) = self.revs.get_mut(&rev_id) {
                if matches!(rev.body, Body::External) {
                    rev.body = Body::Inline(bytes);
                }
            }
        }
        self.orphaned_bodies.extend(orphaned);
        self.changed = true;
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let index: BTreeMap<&RevId, u32> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i as u32))
            .collect();

        let stored: Vec<StoredRevision> = self
            .iter()
            .map(|rev| StoredRevision {
                rev_id: rev.rev_id.to_string(),
                parent: rev.parent.as_ref().and_then(|p| index.get(p).copied()),
                flags: (rev.flags - RevisionFlags::LEAF).bits(),
                sequence: rev.sequence,
                body: rev.body.clone(),
            })
            .collect();

        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::Internal(format!("revision tree encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (stored, _): (Vec<StoredRevision>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::corrupt("revision tree", e))?;

        let ids: Vec<RevId> = stored
            .iter()
            .map(|s| s.rev_id.parse())
            .collect::<Result<_>>()
            .map_err(|e| StoreError::corrupt("revision tree", e))?;

        let mut tree = Self::new();
        for (i, s) in stored.into_iter().enumerate() {
            let parent = match s.parent {
                Some(p) if p as usize == i || p as usize >= ids.len() => {
                    return Err(StoreError::corrupt(
                        "revision tree",
                        format!("bad parent index {p} at {i}"),
                    ));
                }
                Some(p) => Some(ids[p as usize].clone()),
                None => None,
            };
            let rev = Revision {
                rev_id: ids[i].clone(),
                parent,
                flags: RevisionFlags::from_bits_truncate(s.flags) - RevisionFlags::LEAF,
                sequence: s.sequence,
                body: s.body,
            };
            tree.revs.insert(rev.rev_id.clone(), rev);
        }

        // Every parent chain must reach a root within len steps
        for start in tree.revs.keys() {
            let mut cursor = tree.revs.get(start).and_then(|rev| rev.parent.as_ref());
            let mut steps = 0;
            while let Some(id) = cursor {
                steps += 1;
                if steps > tree.revs.len() {
                    return Err(StoreError::corrupt("revision tree", format!("cycle at {start}")));
                }
                cursor = tree.revs.get(id).and_then(|rev| rev.parent.as_ref());
            }
        }

        tree.reindex();
        Ok(tree)
    }

    fn add(
        &mut self,
        rev_id: RevId,
        parent: Option<RevId>,
        body: Body,
        deleted: bool,
        has_attachments: bool,
    ) {
        let mut flags = RevisionFlags::empty();
        flags.set(RevisionFlags::DELETED, deleted);
        flags.set(RevisionFlags::HAS_ATTACHMENTS, has_attachments);
        self.revs.insert(
            rev_id.clone(),
            Revision {
                rev_id,
                parent,
                flags,
                sequence: 0,
                body,
            },
        );
        self.changed = true;
    }

    /// Recompute leaf flags and traversal order after any structural change.
    fn reindex(&mut self) {
        let parents: HashSet<RevId> = self
            .revs
            .values()
            .filter_map(|rev| rev.parent.clone())
            .collect();
        for rev in self.revs.values_mut() {
            rev.flags.set(RevisionFlags::LEAF, !parents.contains(&rev.rev_id));
        }

        let mut order: Vec<&Revision> = self.revs.values().collect();
        order.sort_by(|a, b| b.priority().cmp(&a.priority()));
        self.order = order.into_iter().map(|rev| rev.rev_id.clone()).collect();
    }
}
