//! All-docs and changes enumeration.
//!
//! Verifies:
//! - Skip counts matches identically in both directions
//! - Snapshot isolation against commits made mid-enumeration
//! - Changes feed ordering, deleted filtering and resumable `since`
//! - Metadata-only enumeration leaves trees unloaded

use logos_store::{ContentOptions, Database, DocEnumerator, EnumeratorOptions, StoreConfig};
use tempfile::{tempdir, TempDir};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_db() -> (TempDir, Database) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    (dir, db)
}

/// Save one revision per ID, in order, in a single transaction.
fn create(db: &Database, ids: &[&str], deleted: bool) {
    db.begin_transaction().unwrap();
    for id in ids {
        let mut doc = db.get_document(id.as_bytes(), false).unwrap();
        doc.select_current_revision().ok();
        let generation = doc.rev_id().map_or(1, |r| r.generation() + 1);
        doc.insert_revision(&format!("{generation}-x"), id.as_bytes(), deleted, false, false)
            .unwrap();
        db.save_document(&mut doc, 20).unwrap();
    }
    db.end_transaction(true).unwrap();
}

fn ids(iter: DocEnumerator<'_>) -> Vec<String> {
    iter.map(|doc| String::from_utf8(doc.unwrap().doc_id().to_vec()).unwrap())
        .collect()
}

// ─── All docs ────────────────────────────────────────────────────────────────

#[test]
fn test_all_docs_ascending_and_descending() {
    let (_dir, db) = open_db();
    create(&db, &["c", "a", "e", "b", "d"], false);

    assert_eq!(
        ids(db.enumerate_all_docs(None, None, EnumeratorOptions::default())),
        vec!["a", "b", "c", "d", "e"]
    );
    let descending = EnumeratorOptions {
        descending: true,
        ..Default::default()
    };
    assert_eq!(
        ids(db.enumerate_all_docs(Some(b"d"), Some(b"b"), descending)),
        vec!["d", "c", "b"]
    );
}

#[test]
fn test_skip_is_direction_independent() {
    let (_dir, db) = open_db();
    let all: Vec<String> = (0..20).map(|i| format!("doc{i:02}")).collect();
    let refs: Vec<&str> = all.iter().map(String::as_str).collect();
    create(&db, &refs, false);

    for k in [0, 1, 7, 19, 20, 25] {
        let asc = EnumeratorOptions {
            skip: k,
            ..Default::default()
        };
        let desc = EnumeratorOptions {
            skip: k,
            descending: true,
            ..Default::default()
        };
        let up = ids(db.enumerate_all_docs(None, None, asc));
        let down = ids(db.enumerate_all_docs(None, None, desc));
        assert_eq!(up.len(), 20usize.saturating_sub(k), "skip {k}");
        assert_eq!(down.len(), up.len(), "skip {k}");
        assert_eq!(up, all[k.min(20)..].to_vec());
        let mut reversed = all.clone();
        reversed.reverse();
        assert_eq!(down, reversed[k.min(20)..].to_vec());
    }
}

#[test]
fn test_skip_ignores_filtered_deleted_docs() {
    let (_dir, db) = open_db();
    create(&db, &["a", "c", "e"], false);
    create(&db, &["b", "d"], true);

    let options = EnumeratorOptions {
        skip: 1,
        ..Default::default()
    };
    assert_eq!(ids(db.enumerate_all_docs(None, None, options)), vec!["c", "e"]);

    let with_deleted = EnumeratorOptions {
        skip: 1,
        include_deleted: true,
        ..Default::default()
    };
    assert_eq!(
        ids(db.enumerate_all_docs(None, None, with_deleted)),
        vec!["b", "c", "d", "e"]
    );
}

#[test]
fn test_enumeration_sees_snapshot_at_start() {
    let (_dir, db) = open_db();
    create(&db, &["a", "b"], false);

    let mut iter = db.enumerate_all_docs(None, None, EnumeratorOptions::default());
    assert_eq!(iter.next().unwrap().unwrap().doc_id(), b"a");

    create(&db, &["c"], false);
    assert_eq!(iter.next().unwrap().unwrap().doc_id(), b"b");
    assert!(iter.next().is_none());
    assert!(iter.next().is_none());
}

#[test]
fn test_uncommitted_writes_not_enumerated() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    let mut doc = db.get_document(b"pending", false).unwrap();
    doc.insert_revision("1-a", b"", false, false, false).unwrap();
    db.save_document(&mut doc, 20).unwrap();

    assert!(ids(db.enumerate_all_docs(None, None, EnumeratorOptions::default())).is_empty());
    db.end_transaction(true).unwrap();
    assert_eq!(
        ids(db.enumerate_all_docs(None, None, EnumeratorOptions::default())),
        vec!["pending"]
    );
}

#[test]
fn test_meta_only_enumeration() {
    let (_dir, db) = open_db();
    create(&db, &["a", "b"], false);
    let options = EnumeratorOptions {
        content: ContentOptions::MetaOnly,
        ..Default::default()
    };
    for doc in db.enumerate_all_docs(None, None, options) {
        let doc = doc.unwrap();
        assert!(doc.exists());
        assert!(!doc.revisions_loaded());
        assert_eq!(doc.rev_id().unwrap().to_string(), "1-x");
    }
}

// ─── Changes ─────────────────────────────────────────────────────────────────

#[test]
fn test_changes_follow_latest_save() {
    let (_dir, db) = open_db();
    create(&db, &["a", "b", "c"], false);
    create(&db, &["a"], false);

    let changes: Vec<(String, u64)> = db
        .enumerate_changes(0, false)
        .map(|doc| {
            let doc = doc.unwrap();
            (String::from_utf8(doc.doc_id().to_vec()).unwrap(), doc.sequence())
        })
        .collect();
    assert_eq!(
        changes,
        vec![("b".to_string(), 2), ("c".to_string(), 3), ("a".to_string(), 4)]
    );

    assert_eq!(ids(db.enumerate_changes(3, true)), vec!["a"]);
    assert!(ids(db.enumerate_changes(db.last_sequence(), true)).is_empty());
}

#[test]
fn test_changes_exclude_deleted_by_default() {
    let (_dir, db) = open_db();
    create(&db, &["live"], false);
    create(&db, &["dead"], true);

    assert_eq!(ids(db.enumerate_changes(0, false)), vec!["live"]);

    let options = EnumeratorOptions {
        include_deleted: true,
        ..Default::default()
    };
    assert_eq!(
        ids(db.enumerate_changes_with(0, None, options)),
        vec!["live", "dead"]
    );
}

#[test]
fn test_changes_end_bound_is_inclusive() {
    let (_dir, db) = open_db();
    create(&db, &["a", "b", "c", "d"], false);

    let options = EnumeratorOptions {
        inclusive_end: false,
        ..Default::default()
    };
    assert_eq!(ids(db.enumerate_changes_with(1, Some(3), options)), vec!["b", "c"]);
}
