//! RocksDB-backed update log for one machine.
//!
//! Column families:
//! - `updates`   — merge updates in commit order, LZ4 compressed,
//!   keyed `<project id> 0x00 <seq:8 bytes BE>`
//! - `snapshots` — folded full state per project, LZ4 compressed
//! - `meta`      — schema version and per-project counters (bincode)
//!
//! Loading a project yields its snapshot plus every update appended after
//! it. Because merge updates are idempotent, replaying an update already
//! contained in the snapshot is harmless, so compaction does not need to
//! be atomic with the writes racing it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CF_UPDATES: &str = "updates";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_SNAPSHOTS, CF_META];

/// Bumped whenever the key or value layout changes.
pub const SCHEMA_VERSION: u32 = 1;
const SCHEMA_KEY: &[u8] = b"\0schema_version";
const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub path: PathBuf,
    pub block_cache_size: usize,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl LocalStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-project bookkeeping kept in the `meta` column family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// Sequence number the next append receives
    pub next_seq: u64,
    /// Updates currently stored after the snapshot
    pub update_count: u64,
    pub snapshot_size: u64,
    pub compactions: u64,
    /// Seconds since the epoch
    pub updated_at: u64,
}

impl ProjectMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }
}

/// Everything needed to rebuild a project's document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredProject {
    pub snapshot: Option<Vec<u8>>,
    /// `(seq, update)` in append order
    pub updates: Vec<(u64, Vec<u8>)>,
}

impl StoredProject {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store schema version {found} does not match {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
    #[error("invalid project id {0:?}")]
    InvalidProjectId(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: LocalStoreConfig,
    /// Serializes read-modify-write of project metadata
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Open the store, creating it if missing.
    pub fn open(config: LocalStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            write_lock: Mutex::new(()),
        };
        store.check_schema()?;
        Ok(store)
    }

    /// Open the store; if it is unreadable or from another schema, wipe it
    /// and start over. Peers and the remote store still hold the content.
    pub fn open_or_recover(config: LocalStoreConfig) -> Result<Self, StoreError> {
        match Self::open(config.clone()) {
            Ok(store) => Ok(store),
            Err(e) => {
                log::warn!(
                    "Local store at {} unusable ({e}), recreating it",
                    config.path.display()
                );
                if let Err(e) =
                    DBWithThreadMode::<SingleThreaded>::destroy(&Options::default(), &config.path)
                {
                    log::warn!("Destroy failed ({e}), removing the directory");
                    std::fs::remove_dir_all(&config.path)
                        .map_err(|io| StoreError::Database(io.to_string()))?;
                }
                Self::open(config)
            }
        }
    }

    fn cf_options(name: &str, config: &LocalStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn check_schema(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, SCHEMA_KEY)? {
            Some(bytes) => {
                let found = <[u8; 4]>::try_from(bytes.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| StoreError::Deserialization("schema version".into()))?;
                if found != SCHEMA_VERSION {
                    return Err(StoreError::SchemaMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
                Ok(())
            }
            None => {
                self.db.put_cf(cf, SCHEMA_KEY, SCHEMA_VERSION.to_be_bytes())?;
                Ok(())
            }
        }
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append one merge update; returns its sequence number.
    pub fn append(&self, project_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        let prefix = Self::project_prefix(project_id)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let _guard = self.lock();

        let mut meta = self.metadata(project_id)?;
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.update_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, Self::update_key(&prefix, seq), lz4_flex::compress_prepend_size(update));
        batch.put_cf(cf_meta, project_id.as_bytes(), meta.encode()?);
        self.write(batch)?;
        Ok(seq)
    }

    /// Snapshot plus the updates appended after it.
    pub fn load(&self, project_id: &str) -> Result<StoredProject, StoreError> {
        let prefix = Self::project_prefix(project_id)?;
        let snapshot = match self.db.get_cf(self.cf(CF_SNAPSHOTS)?, project_id.as_bytes())? {
            Some(compressed) => Some(decompress(&compressed)?),
            None => None,
        };

        let mut updates = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_UPDATES)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            let Some(seq) = Self::seq_of(&prefix, &key) else { break };
            updates.push((seq, decompress(&value)?));
        }

        Ok(StoredProject { snapshot, updates })
    }

    pub fn update_count(&self, project_id: &str) -> Result<u64, StoreError> {
        Ok(self.metadata(project_id)?.update_count)
    }

    /// Replace the snapshot with `snapshot` and drop updates up to and
    /// including `up_to_seq`. Returns how many updates were dropped.
    pub fn compact(&self, project_id: &str, snapshot: &[u8], up_to_seq: u64) -> Result<u64, StoreError> {
        let prefix = Self::project_prefix(project_id)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let _guard = self.lock();

        let mut batch = WriteBatch::default();
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, project_id.as_bytes(), &compressed);

        let mut removed = 0u64;
        let iter = self
            .db
            .iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::seq_of(&prefix, &key) {
                Some(seq) if seq <= up_to_seq => {
                    batch.delete_cf(cf_updates, &key);
                    removed += 1;
                }
                _ => break,
            }
        }

        let mut meta = self.metadata(project_id)?;
        meta.update_count = meta.update_count.saturating_sub(removed);
        meta.snapshot_size = compressed.len() as u64;
        meta.compactions += 1;
        meta.touch();
        batch.put_cf(self.cf(CF_META)?, project_id.as_bytes(), meta.encode()?);

        self.write(batch)?;
        log::debug!("Compacted {removed} updates of {project_id} into a {} byte snapshot", snapshot.len());
        Ok(removed)
    }

    /// Forget everything stored for a project.
    pub fn clear(&self, project_id: &str) -> Result<(), StoreError> {
        let prefix = Self::project_prefix(project_id)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let _guard = self.lock();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, project_id.as_bytes());
        batch.delete_cf(self.cf(CF_META)?, project_id.as_bytes());
        let iter = self
            .db
            .iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if Self::seq_of(&prefix, &key).is_none() {
                break;
            }
            batch.delete_cf(cf_updates, &key);
        }
        self.write(batch)
    }

    pub fn metadata(&self, project_id: &str) -> Result<ProjectMetadata, StoreError> {
        match self.db.get_cf(self.cf(CF_META)?, project_id.as_bytes())? {
            Some(bytes) => ProjectMetadata::decode(&bytes),
            None => Ok(ProjectMetadata::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn project_prefix(project_id: &str) -> Result<Vec<u8>, StoreError> {
        if project_id.is_empty() || project_id.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidProjectId(project_id.to_string()));
        }
        let mut prefix = Vec::with_capacity(project_id.len() + 1);
        prefix.extend_from_slice(project_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        Ok(prefix)
    }

    fn update_key(prefix: &[u8], seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Sequence number of `key` if it belongs to `prefix`.
    fn seq_of(prefix: &[u8], key: &[u8]) -> Option<u64> {
        let rest = key.strip_prefix(prefix)?;
        <[u8; 8]>::try_from(rest).ok().map(u64::from_be_bytes)
    }
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> LocalStore {
        LocalStore::open(LocalStoreConfig::for_testing(dir.join("db"))).unwrap()
    }

    #[test]
    fn test_append_and_load_in_order() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert!(store.load("p1").unwrap().is_empty());

        assert_eq!(store.append("p1", b"one").unwrap(), 0);
        assert_eq!(store.append("p1", b"two").unwrap(), 1);
        store.append("p2", b"other").unwrap();

        let loaded = store.load("p1").unwrap();
        assert_eq!(loaded.snapshot, None);
        assert_eq!(loaded.updates, vec![(0, b"one".to_vec()), (1, b"two".to_vec())]);
        assert_eq!(store.update_count("p1").unwrap(), 2);
    }

    #[test]
    fn test_prefix_does_not_leak_between_projects() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.append("p", b"short").unwrap();
        store.append("p1", b"long").unwrap();
        assert_eq!(store.load("p").unwrap().updates.len(), 1);
        assert_eq!(store.load("p1").unwrap().updates.len(), 1);
    }

    #[test]
    fn test_compact_keeps_later_updates() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for i in 0..5u8 {
            store.append("p1", &[i]).unwrap();
        }
        assert_eq!(store.compact("p1", b"snapshot", 2).unwrap(), 3);

        let loaded = store.load("p1").unwrap();
        assert_eq!(loaded.snapshot.as_deref(), Some(&b"snapshot"[..]));
        assert_eq!(loaded.updates, vec![(3, vec![3]), (4, vec![4])]);

        let meta = store.metadata("p1").unwrap();
        assert_eq!(meta.update_count, 2);
        assert_eq!(meta.next_seq, 5);
        assert_eq!(meta.compactions, 1);
    }

    #[test]
    fn test_reopen_preserves_sequence() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.append("p1", b"a").unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.append("p1", b"b").unwrap(), 1);
        assert_eq!(store.load("p1").unwrap().updates.len(), 2);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.append("p1", b"a").unwrap();
        store.compact("p1", b"s", 0).unwrap();
        store.append("p1", b"b").unwrap();
        store.clear("p1").unwrap();
        assert!(store.load("p1").unwrap().is_empty());
        assert_eq!(store.metadata("p1").unwrap(), ProjectMetadata::default());
    }

    #[test]
    fn test_invalid_project_id() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert!(matches!(store.append("", b"x"), Err(StoreError::InvalidProjectId(_))));
        assert!(matches!(store.append("a\0b", b"x"), Err(StoreError::InvalidProjectId(_))));
    }

    #[test]
    fn test_schema_mismatch_is_recovered() {
        let dir = tempdir().unwrap();
        let config = LocalStoreConfig::for_testing(dir.path().join("db"));
        {
            let store = LocalStore::open(config.clone()).unwrap();
            store.append("p1", b"a").unwrap();
            let cf = store.cf(CF_META).unwrap();
            store.db.put_cf(cf, SCHEMA_KEY, 99u32.to_be_bytes()).unwrap();
        }
        assert!(matches!(
            LocalStore::open(config.clone()),
            Err(StoreError::SchemaMismatch { found: 99, expected: SCHEMA_VERSION })
        ));

        let store = LocalStore::open_or_recover(config).unwrap();
        assert!(store.load("p1").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_directory_is_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("CURRENT"), b"not a manifest\n").unwrap();

        let store = LocalStore::open_or_recover(LocalStoreConfig::for_testing(&path)).unwrap();
        store.append("p1", b"a").unwrap();
        assert_eq!(store.update_count("p1").unwrap(), 1);
    }
}
