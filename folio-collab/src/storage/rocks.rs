//! RocksDB-backed document store.
//!
//! Column families:
//! - `snapshots`: Full document state (LZ4 compressed), keyed by object id
//! - `updates`  : Admitted updates (LZ4 compressed), keyed by object id + Rid
//! - `metadata` : Per-document heads and sizes (bincode)
//! - `cursors`  : Client resume cursors (12-byte Rid), keyed by object id
//!
//! Update keys are `<len:u16 BE><object_id><rid:12 bytes>`. The length prefix
//! keeps one document's range from bleeding into another's; the Rid suffix
//! is big-endian so byte order equals stream order.
//!
//! Reference: Kleppmann, DDIA Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{CursorStore, StoreError};
use crate::protocol::CollabType;
use crate::rid::{Rid, RID_KEY_LEN};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";
const CF_CURSORS: &str = "cursors";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_METADATA, CF_CURSORS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub object_id: String,
    /// Wire value of the document's [`CollabType`].
    pub collab_type: i32,
    /// Highest Rid admitted into the stream.
    pub head: Rid,
    /// Highest Rid folded into the stored snapshot.
    pub snapshot_head: Rid,
    /// Updates appended since the document was created.
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(object_id: &str, collab_type: CollabType) -> Self {
        let now = unix_secs();
        Self {
            object_id: object_id.to_owned(),
            collab_type: collab_type.to_i32(),
            head: Rid::ZERO,
            snapshot_head: Rid::ZERO,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn collab_type(&self) -> CollabType {
        CollabType::from_i32(self.collab_type)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed store for the server's document streams and for
/// client cursors.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
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
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

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
            CF_SNAPSHOTS => {
                // Large values, point lookups only
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            CF_UPDATES => {
                // Many small writes, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            CF_CURSORS => {
                // Tiny values, rewritten after every applied update
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save full document state covering every update up to `head`.
    pub fn save_snapshot(
        &self,
        object_id: &str,
        collab_type: CollabType,
        head: Rid,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(object_id)?
            .unwrap_or_else(|| DocumentMetadata::new(object_id, collab_type));
        meta.collab_type = collab_type.to_i32();
        meta.head = meta.head.max(head);
        meta.snapshot_head = head;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snaps, object_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, object_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Saved snapshot for {object_id} at {head} ({} -> {} bytes)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a document's snapshot, if one was saved.
    pub fn load_snapshot(&self, object_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, object_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, object_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, object_id.as_bytes())?.is_some())
    }

    // ─── Update stream ────────────────────────────────────────────────

    /// Append one admitted update.
    pub fn append_update(
        &self,
        object_id: &str,
        collab_type: CollabType,
        rid: Rid,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = update_key(object_id, rid)?;
        let compressed = lz4_flex::compress_prepend_size(payload);

        let mut meta = self
            .load_metadata(object_id)?
            .unwrap_or_else(|| DocumentMetadata::new(object_id, collab_type));
        meta.head = meta.head.max(rid);
        meta.update_count += 1;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, &key, &compressed);
        batch.put_cf(&cf_meta, object_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    /// Raise the recorded head for a Rid that was issued without an update.
    pub fn advance_head(
        &self,
        object_id: &str,
        collab_type: CollabType,
        head: Rid,
    ) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let mut meta = self
            .load_metadata(object_id)?
            .unwrap_or_else(|| DocumentMetadata::new(object_id, collab_type));
        if meta.head >= head {
            return Ok(());
        }
        meta.head = head;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_meta, object_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    /// Updates strictly after `after`, in stream order.
    pub fn updates_since(
        &self,
        object_id: &str,
        after: Rid,
    ) -> Result<Vec<(Rid, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(object_id)?;
        let start = update_key(object_id, after)?;

        let mut updates = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(rid) = rid_in_key(&prefix, &key) else {
                break;
            };
            if rid <= after {
                continue;
            }
            let payload = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((rid, payload));
        }
        Ok(updates)
    }

    /// Delete updates at or below `up_to` (already folded into a snapshot).
    pub fn compact_updates(&self, object_id: &str, up_to: Rid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(object_id)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match rid_in_key(&prefix, &key) {
                Some(rid) if rid <= up_to => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            self.write(batch)?;
            log::debug!("Compacted {count} updates for {object_id} up to {up_to}");
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, object_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, object_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Object ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Deserialization("object id is not UTF-8".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete a document's snapshot, updates and metadata.
    pub fn delete_document(&self, object_id: &str) -> Result<(), StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(object_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snaps, object_id.as_bytes());
        batch.delete_cf(&cf_meta, object_id.as_bytes());

        let iter = self
            .db
            .iterator_cf(&cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if rid_in_key(&prefix, &key).is_none() {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
        }

        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl CursorStore for DocumentStore {
    fn load(&self, object_id: &str) -> Result<Option<Rid>, StoreError> {
        let cf = self.cf(CF_CURSORS)?;
        match self.db.get_cf(&cf, object_id.as_bytes())? {
            Some(bytes) => Rid::from_key_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Deserialization(format!("cursor for {object_id}"))),
            None => Ok(None),
        }
    }

    fn save(&self, object_id: &str, rid: Rid) -> Result<(), StoreError> {
        let cf = self.cf(CF_CURSORS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, object_id.as_bytes(), rid.to_key_bytes(), &write_opts)?;
        Ok(())
    }

    fn remove(&self, object_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_CURSORS)?;
        self.db.delete_cf(&cf, object_id.as_bytes())?;
        Ok(())
    }
}

fn update_prefix(object_id: &str) -> Result<Vec<u8>, StoreError> {
    let len = u16::try_from(object_id.len()).map_err(|_| StoreError::KeyTooLong(object_id.len()))?;
    let mut prefix = Vec::with_capacity(2 + object_id.len() + RID_KEY_LEN);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(object_id.as_bytes());
    Ok(prefix)
}

fn update_key(object_id: &str, rid: Rid) -> Result<Vec<u8>, StoreError> {
    let mut key = update_prefix(object_id)?;
    key.extend_from_slice(&rid.to_key_bytes());
    Ok(key)
}

/// The Rid of an update key, or `None` if the key belongs to another document.
fn rid_in_key(prefix: &[u8], key: &[u8]) -> Option<Rid> {
    if key.len() != prefix.len() + RID_KEY_LEN || !key.starts_with(prefix) {
        return None;
    }
    Rid::from_key_bytes(&key[prefix.len()..])
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
