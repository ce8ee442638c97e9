use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use logos_store::{
    CollatableBuilder, ContentOptions, Database, EnumeratorOptions, RevId, RevTree, StoreConfig,
};
use std::hint::black_box;
use tempfile::tempdir;

fn deep_tree(depth: u32) -> RevTree {
    let mut tree = RevTree::new();
    let mut parent: Option<RevId> = None;
    for generation in 1..=depth {
        let id = RevId::new(generation, format!("{generation:032x}")).unwrap();
        tree.insert(id.clone(), vec![b'x'; 256], false, false, parent.as_ref(), false)
            .unwrap();
        parent = Some(id);
    }
    tree
}

fn bench_revid_parse(c: &mut Criterion) {
    c.bench_function("revid_parse", |b| {
        b.iter(|| black_box("123-0123456789abcdef0123456789abcdef".parse::<RevId>().unwrap()))
    });
}

fn bench_tree_encode_20(c: &mut Criterion) {
    let tree = deep_tree(20);
    c.bench_function("rev_tree_encode_20", |b| {
        b.iter(|| black_box(tree.encode().unwrap()))
    });
}

fn bench_tree_decode_20(c: &mut Criterion) {
    let encoded = deep_tree(20).encode().unwrap();
    c.bench_function("rev_tree_decode_20", |b| {
        b.iter(|| black_box(RevTree::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_tree_prune_100_to_20(c: &mut Criterion) {
    let tree = deep_tree(100);
    c.bench_function("rev_tree_prune_100_to_20", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut tree| black_box(tree.prune(20)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_collatable_expiry_key(c: &mut Criterion) {
    c.bench_function("collatable_expiry_key", |b| {
        b.iter(|| {
            let mut key = CollatableBuilder::new();
            key.begin_array()
                .add_int(black_box(1_700_000_000))
                .add_string(black_box("document-0001"))
                .end_array();
            black_box(key.into_bytes())
        })
    });
}

fn bench_save_document(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let body = vec![b'x'; 1024];
    let mut counter = 0u64;

    c.bench_function("save_document_1KB", |b| {
        b.iter(|| {
            counter += 1;
            let id = format!("doc{counter}");
            db.begin_transaction().unwrap();
            let mut doc = db.get_document(id.as_bytes(), false).unwrap();
            doc.insert_revision("1-a", &body, false, false, false).unwrap();
            db.save_document(&mut doc, 20).unwrap();
            db.end_transaction(true).unwrap();
        })
    });
}

fn bench_load_document(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    db.begin_transaction().unwrap();
    let mut doc = db.get_document(b"hot", false).unwrap();
    for generation in 1..=20 {
        doc.insert_revision(&format!("{generation}-r"), &[b'y'; 1024], false, false, false)
            .unwrap();
    }
    db.save_document(&mut doc, 20).unwrap();
    db.end_transaction(true).unwrap();

    c.bench_function("load_document_20_revs", |b| {
        b.iter(|| black_box(db.get_document(b"hot", true).unwrap()))
    });
}

fn bench_changes_meta_only_1000(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    db.begin_transaction().unwrap();
    for i in 0..1000 {
        let mut doc = db.get_document(format!("doc{i:04}").as_bytes(), false).unwrap();
        doc.insert_revision("1-a", b"{}", false, false, false).unwrap();
        db.save_document(&mut doc, 20).unwrap();
    }
    db.end_transaction(true).unwrap();

    let options = EnumeratorOptions {
        content: ContentOptions::MetaOnly,
        ..Default::default()
    };
    c.bench_function("changes_meta_only_1000", |b| {
        b.iter(|| {
            let count = db
                .enumerate_changes_with(0, None, options.clone())
                .filter(|doc| doc.is_ok())
                .count();
            black_box(count)
        })
    });
}

criterion_group!(
    benches,
    bench_revid_parse,
    bench_tree_encode_20,
    bench_tree_decode_20,
    bench_tree_prune_100_to_20,
    bench_collatable_expiry_key,
    bench_save_document,
    bench_load_document,
    bench_changes_meta_only_1000,
);
criterion_main!(benches);
