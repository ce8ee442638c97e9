//! RocksDB-backed keyspaces.
//!
//! Column families:
//! - `default`  : doc_id → record (meta + encoded revision tree)
//! - `sequences`: sequence (8 bytes BE) → doc_id
//! - `bodies`   : archived revision bodies keyed by `[doc_id, rev_id, sequence]`
//! - `expiry`   : expiration index keyed by `[timestamp, doc_id]`
//! - anything else: raw keyspaces, created on first write
//!
//! Reads inside enumerations go through a [`Snapshot`], so a scan never
//! observes writes committed after it started.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType,
    DBRawIteratorWithThreadMode, DBWithThreadMode, IteratorMode, MultiThreaded, Options,
    ReadOptions, SnapshotWithThreadMode, WriteBatch, WriteOptions,
};

use super::transaction::WriteSet;
use crate::error::{Result, StoreError};

/// Column family names.
pub(crate) const KS_DOCUMENTS: &str = "default";
pub(crate) const KS_SEQUENCES: &str = "sequences";
pub(crate) const KS_BODIES: &str = "bodies";
pub(crate) const KS_EXPIRY: &str = "expiry";

/// Keyspaces owned by the document layer; raw access to them is refused.
pub(crate) const INTERNAL_KEYSPACES: &[&str] = &[KS_DOCUMENTS, KS_SEQUENCES, KS_BODIES, KS_EXPIRY];

/// Multi-threaded mode so raw keyspaces can be created through `&self`.
pub(crate) type Engine = DBWithThreadMode<MultiThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Open without write access; every write path fails with `Precondition`
    pub read_only: bool,
    /// Create the database directory if missing (default: true)
    pub create_if_missing: bool,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// LZ4-compress encoded revision trees and archived bodies (default: true)
    pub compress_bodies: bool,
    /// Depth used by `save_document_default` (default: 20)
    pub default_max_rev_tree_depth: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_store"),
            read_only: false,
            create_if_missing: true,
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            compress_bodies: true,
            default_max_rev_tree_depth: 20,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            ..Self::default()
        }
    }
}

/// Thin wrapper over the RocksDB instance: keyspace lookup, point reads,
/// batch commits and snapshots.
pub(crate) struct KeyValueStore {
    db: Engine,
    config: StoreConfig,
}

impl KeyValueStore {
    /// Open the store, creating the built-in column families and reopening
    /// any raw keyspaces left by earlier sessions.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(config.create_if_missing);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut names: Vec<String> = INTERNAL_KEYSPACES.iter().map(|s| s.to_string()).collect();
        // Fails on a fresh directory; the built-in list is enough then.
        if let Ok(existing) = Engine::list_cf(&db_opts, &config.path) {
            for name in existing {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options(name, &config)))
            .collect();

        let db = if config.read_only {
            Engine::open_cf_descriptors_read_only(&db_opts, &config.path, cf_descriptors, false)?
        } else {
            Engine::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?
        };

        log::debug!(
            "Opened store at {} with {} keyspaces{}",
            config.path.display(),
            names.len(),
            if config.read_only { " (read-only)" } else { "" }
        );

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            KS_DOCUMENTS => {
                // Point lookups by doc_id dominate; range scans for all-docs
                opts.set_max_write_buffer_number(3);
            }
            KS_SEQUENCES => {
                // Small fixed-width keys, appended in order
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            KS_BODIES => {
                // Bodies are already LZ4-compressed by the record layer
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn has_keyspace(&self, name: &str) -> bool {
        self.db.cf_handle(name).is_some()
    }

    /// Create a raw keyspace if it does not exist yet.
    pub fn ensure_keyspace(&self, name: &str) -> Result<()> {
        if self.has_keyspace(name) {
            return Ok(());
        }
        self.db.create_cf(name, &Self::cf_options(name, &self.config))?;
        log::debug!("Created keyspace '{name}'");
        Ok(())
    }

    /// Point read of committed data. A missing keyspace reads as empty.
    pub fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.db.cf_handle(keyspace) {
            Some(cf) => Ok(self.db.get_cf(&cf, key)?),
            None => Ok(None),
        }
    }

    /// Highest key in a keyspace.
    pub fn last_key(&self, keyspace: &str) -> Result<Option<Vec<u8>>> {
        let cf = match self.db.cf_handle(keyspace) {
            Some(cf) => cf,
            None => return Ok(None),
        };
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => Ok(Some(key.to_vec())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Atomically write a staged set as one batch.
    pub fn write(&self, writes: &WriteSet) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (keyspace, key, value) in writes.iter() {
            match (self.db.cf_handle(keyspace), value) {
                (Some(cf), Some(value)) => batch.put_cf(&cf, key, value),
                (Some(cf), None) => batch.delete_cf(&cf, key),
                // Deleting from a keyspace that never existed is a no-op
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(StoreError::Internal(format!(
                        "keyspace '{keyspace}' vanished before commit"
                    )))
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Compact every column family.
    pub fn compact_all(&self) -> Result<()> {
        let names = Engine::list_cf(&Options::default(), &self.config.path)?;
        for name in names {
            if let Some(cf) = self.db.cf_handle(&name) {
                self.db.compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            store: self,
            inner: self.db.snapshot(),
        }
    }
}

/// A consistent, read-only view of every keyspace.
pub(crate) struct Snapshot<'a> {
    store: &'a KeyValueStore,
    inner: SnapshotWithThreadMode<'a, Engine>,
}

impl<'a> Snapshot<'a> {
    pub fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.store.db.cf_handle(keyspace) {
            Some(cf) => Ok(self.inner.get_cf(&cf, key)?),
            None => Ok(None),
        }
    }

    /// Turn the snapshot into an ordered scan over one keyspace.
    pub fn scan(self, keyspace: &str) -> Scan<'a> {
        let store: &'a KeyValueStore = self.store;
        let iter = store.db.cf_handle(keyspace).map(|cf| {
            let mut opts = ReadOptions::default();
            opts.set_snapshot(&self.inner);
            store.db.raw_iterator_cf_opt(&cf, opts)
        });
        Scan {
            iter,
            snapshot: self,
        }
    }
}

/// Cursor over one keyspace pinned to a snapshot. A keyspace that does not
/// exist scans as empty.
pub(crate) struct Scan<'a> {
    // Declared first so the iterator is released before its snapshot.
    iter: Option<DBRawIteratorWithThreadMode<'a, Engine>>,
    snapshot: Snapshot<'a>,
}

impl<'a> Scan<'a> {
    /// Point reads against the same snapshot the scan uses.
    pub fn snapshot(&self) -> &Snapshot<'a> {
        &self.snapshot
    }

    pub fn seek_to_first(&mut self) {
        if let Some(iter) = self.iter.as_mut() {
            iter.seek_to_first();
        }
    }

    pub fn seek_to_last(&mut self) {
        if let Some(iter) = self.iter.as_mut() {
            iter.seek_to_last();
        }
    }

    /// Position at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        if let Some(iter) = self.iter.as_mut() {
            iter.seek(key);
        }
    }

    /// Position at the last key `<= key`.
    pub fn seek_for_prev(&mut self, key: &[u8]) {
        if let Some(iter) = self.iter.as_mut() {
            iter.seek_for_prev(key);
        }
    }

    pub fn next(&mut self) {
        if let Some(iter) = self.iter.as_mut() {
            if iter.valid() {
                iter.next();
            }
        }
    }

    pub fn prev(&mut self) {
        if let Some(iter) = self.iter.as_mut() {
            if iter.valid() {
                iter.prev();
            }
        }
    }

    /// Current entry, `None` once the cursor runs off either end.
    pub fn entry(&self) -> Result<Option<(&[u8], &[u8])>> {
        let iter = match self.iter.as_ref() {
            Some(iter) => iter,
            None => return Ok(None),
        };
        match (iter.key(), iter.value()) {
            (Some(key), Some(value)) => Ok(Some((key, value))),
            _ => {
                iter.status()?;
                Ok(None)
            }
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_builtin_keyspaces() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        for name in INTERNAL_KEYSPACES {
            assert!(store.has_keyspace(name), "missing {name}");
        }
        assert!(!store.has_keyspace("local"));
    }

    #[test]
    fn test_write_set_commit_and_get() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let mut writes = WriteSet::default();
        writes.put(KS_DOCUMENTS, b"a".to_vec(), b"1".to_vec());
        writes.put(KS_DOCUMENTS, b"b".to_vec(), b"2".to_vec());
        store.write(&writes).unwrap();
        assert_eq!(store.get(KS_DOCUMENTS, b"a").unwrap(), Some(b"1".to_vec()));

        let mut writes = WriteSet::default();
        writes.delete(KS_DOCUMENTS, b"a".to_vec());
        writes.delete("never_created", b"x".to_vec());
        store.write(&writes).unwrap();
        assert_eq!(store.get(KS_DOCUMENTS, b"a").unwrap(), None);
        assert_eq!(store.get("never_created", b"x").unwrap(), None);
    }

    #[test]
    fn test_put_into_missing_keyspace_is_rejected() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let mut writes = WriteSet::default();
        writes.put("nope", b"k".to_vec(), b"v".to_vec());
        assert!(matches!(store.write(&writes), Err(StoreError::Internal(_))));
    }

    #[test]
    fn test_raw_keyspace_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = KeyValueStore::open(config.clone()).unwrap();
            store.ensure_keyspace("local").unwrap();
            let mut writes = WriteSet::default();
            writes.put("local", b"k".to_vec(), b"v".to_vec());
            store.write(&writes).unwrap();
        }
        let store = KeyValueStore::open(config).unwrap();
        assert!(store.has_keyspace("local"));
        assert_eq!(store.get("local", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_scan_ignores_later_writes() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let mut writes = WriteSet::default();
        writes.put(KS_SEQUENCES, 1u64.to_be_bytes().to_vec(), b"a".to_vec());
        store.write(&writes).unwrap();

        let mut scan = store.snapshot().scan(KS_SEQUENCES);

        let mut writes = WriteSet::default();
        writes.put(KS_SEQUENCES, 2u64.to_be_bytes().to_vec(), b"b".to_vec());
        store.write(&writes).unwrap();

        scan.seek_to_first();
        let mut seen = Vec::new();
        while let Some((_, value)) = scan.entry().unwrap() {
            seen.push(value.to_vec());
            scan.next();
        }
        assert_eq!(seen, vec![b"a".to_vec()]);
        assert_eq!(scan.snapshot().get(KS_SEQUENCES, &2u64.to_be_bytes()).unwrap(), None);
        assert_eq!(store.last_key(KS_SEQUENCES).unwrap(), Some(2u64.to_be_bytes().to_vec()));
    }

    #[test]
    fn test_scan_of_missing_keyspace_is_empty() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let mut scan = store.snapshot().scan("absent");
        scan.seek_to_first();
        assert!(scan.entry().unwrap().is_none());
    }
}
