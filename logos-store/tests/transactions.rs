//! Transactions, the expiry sweep and raw keyspaces.
//!
//! Verifies:
//! - Nested begin/end pairs commit exactly once, at the outermost end
//! - Outermost abort discards everything, including inner "commits"
//! - Contract violations fail loudly with `Precondition`
//! - Expiry enumeration against a fixed "now" and the all-or-nothing purge
//! - Raw records join an open transaction and survive reopen

use logos_store::{
    Database, EnumeratorOptions, ErrorDomain, ExpiryEnumerator, StoreConfig, StoreError,
};
use tempfile::{tempdir, TempDir};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_db() -> (TempDir, Database) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    (dir, db)
}

fn stage_doc(db: &Database, id: &str) {
    let mut doc = db.get_document(id.as_bytes(), false).unwrap();
    doc.insert_revision("1-a", id.as_bytes(), false, false, false).unwrap();
    db.save_document(&mut doc, 20).unwrap();
}

fn committed_ids(db: &Database) -> Vec<Vec<u8>> {
    db.enumerate_all_docs(None, None, EnumeratorOptions::default())
        .map(|doc| doc.unwrap().doc_id().to_vec())
        .collect()
}

// ─── Nesting ─────────────────────────────────────────────────────────────────

#[test]
fn test_nested_transactions_commit_once() {
    let (_dir, db) = open_db();

    db.begin_transaction().unwrap();
    db.begin_transaction().unwrap();
    stage_doc(&db, "inner");
    db.end_transaction(true).unwrap();

    assert!(db.is_in_transaction().unwrap());
    assert!(committed_ids(&db).is_empty());
    assert_eq!(db.last_sequence(), 0);

    stage_doc(&db, "outer");
    db.end_transaction(true).unwrap();

    assert!(!db.is_in_transaction().unwrap());
    assert_eq!(committed_ids(&db), vec![b"inner".to_vec(), b"outer".to_vec()]);
    assert_eq!(db.last_sequence(), 2);
}

#[test]
fn test_outer_abort_discards_inner_commit() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    db.begin_transaction().unwrap();
    stage_doc(&db, "doomed");
    db.end_transaction(true).unwrap();
    db.end_transaction(false).unwrap();

    assert!(committed_ids(&db).is_empty());
    assert!(!db.get_document(b"doomed", false).unwrap().exists());
    assert_eq!(db.last_sequence(), 0);
}

#[test]
fn test_end_without_begin_fails_loudly() {
    let (_dir, db) = open_db();
    for commit in [false, true] {
        let err = db.end_transaction(commit).unwrap_err();
        assert!(matches!(err, StoreError::Precondition(_)));
        assert_eq!(err.status(), (ErrorDomain::Http, 412));
    }
}

#[test]
fn test_writes_outside_transaction_rejected() {
    let (_dir, db) = open_db();
    let mut doc = db.get_document(b"x", false).unwrap();
    doc.insert_revision("1-a", b"", false, false, false).unwrap();
    assert!(matches!(db.save_document(&mut doc, 20), Err(StoreError::Precondition(_))));
    assert!(matches!(db.set_expiration(b"x", 10), Err(StoreError::Precondition(_))));
    assert!(!db.is_in_transaction().unwrap());
}

#[test]
fn test_failed_save_keeps_transaction_usable() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    stage_doc(&db, "good");

    // Conflict is local to the document; the transaction carries on
    let mut doc = db.get_document(b"good", true).unwrap();
    doc.insert_revision("2-b", b"", false, false, false).unwrap();
    doc.select_revision("1-a").unwrap();
    assert!(doc
        .insert_revision("2-c", b"", false, false, false)
        .unwrap_err()
        .is_conflict());
    db.save_document(&mut doc, 20).unwrap();
    db.end_transaction(true).unwrap();

    let doc = db.get_document(b"good", true).unwrap();
    assert_eq!(doc.rev_id().unwrap().to_string(), "2-b");
}

// ─── Expiry ──────────────────────────────────────────────────────────────────

#[test]
fn test_expiry_enumerate_and_purge_at_fixed_now() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    stage_doc(&db, "early");
    stage_doc(&db, "late");
    db.set_expiration(b"early", 100).unwrap();
    db.set_expiration(b"late", 200).unwrap();
    db.end_transaction(true).unwrap();

    let due: Vec<_> = ExpiryEnumerator::with_now(&db, 150)
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].timestamp, 100);
    assert_eq!(due[0].doc_id, b"early");
    assert!(!due[0].key().is_empty());

    let mut sweeper = ExpiryEnumerator::with_now(&db, 150);
    assert_eq!(sweeper.purge_expired().unwrap(), 1);
    assert_eq!(sweeper.now(), 150);

    assert!(!db.get_document(b"early", false).unwrap().exists());
    assert!(db.get_document(b"late", true).unwrap().exists());
    assert_eq!(db.next_expiration().unwrap(), Some(200));
    assert_eq!(ExpiryEnumerator::with_now(&db, 150).count(), 0);
    assert!(!db.is_in_transaction().unwrap());
}

#[test]
fn test_expiry_boundary_is_inclusive() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    db.set_expiration(b"edge", 150).unwrap();
    db.end_transaction(true).unwrap();

    assert_eq!(ExpiryEnumerator::with_now(&db, 149).count(), 0);
    assert_eq!(ExpiryEnumerator::with_now(&db, 150).count(), 1);
}

#[test]
fn test_expiry_reset_and_close() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    db.set_expiration(b"a", 10).unwrap();
    db.set_expiration(b"b", 20).unwrap();
    db.end_transaction(true).unwrap();

    let mut expired = ExpiryEnumerator::with_now(&db, 100);
    assert_eq!(expired.by_ref().count(), 2);
    assert!(expired.next().is_none());

    expired.reset();
    assert_eq!(expired.next().unwrap().unwrap().doc_id, b"a");
    expired.close();
    assert!(expired.next().is_none());
}

#[test]
fn test_purge_expired_inside_outer_transaction_joins_it() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    stage_doc(&db, "old");
    db.set_expiration(b"old", 1).unwrap();
    db.end_transaction(true).unwrap();

    db.begin_transaction().unwrap();
    assert_eq!(ExpiryEnumerator::with_now(&db, 5).purge_expired().unwrap(), 1);
    // Still staged: the outer abort wins
    db.end_transaction(false).unwrap();
    assert!(db.get_document(b"old", true).unwrap().exists());
    assert_eq!(db.next_expiration().unwrap(), Some(1));
}

#[test]
fn test_purge_with_nothing_due() {
    let (_dir, db) = open_db();
    assert_eq!(db.purge_expired().unwrap(), 0);
    assert_eq!(db.next_expiration().unwrap(), None);
}

// ─── Raw keyspaces ───────────────────────────────────────────────────────────

#[test]
fn test_raw_put_joins_open_transaction() {
    let (_dir, db) = open_db();
    db.begin_transaction().unwrap();
    db.raw_put("checkpoints", b"peer1", b"", b"seq=42").unwrap();
    assert_eq!(db.raw_get("checkpoints", b"peer1").unwrap().body, b"seq=42");
    db.end_transaction(false).unwrap();

    assert!(db.raw_get("checkpoints", b"peer1").unwrap_err().is_not_found());
}

#[test]
fn test_raw_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));
    {
        let db = Database::open(config.clone()).unwrap();
        db.raw_put("info", b"uuid", b"v1", b"abcd").unwrap();
    }
    let db = Database::open(config).unwrap();
    let raw = db.raw_get("info", b"uuid").unwrap();
    assert_eq!(raw.key, b"uuid");
    assert_eq!(raw.meta, b"v1");
    assert_eq!(raw.body, b"abcd");
}
