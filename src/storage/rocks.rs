//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — full document content blobs, LZ4 compressed
//! - `metadata`  — per-document bookkeeping (kind, sizes, write count)
//!
//! Last-snapshot-wins: each write replaces the previous blob atomically
//! (snapshot + metadata in one `WriteBatch`). There is no change-stream
//! history here.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{DocumentKind, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-supplied temp directory).
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

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub document_id: Uuid,
    /// workspace | folder | file; the host tags it, the core never reads it
    pub kind: DocumentKind,
    /// Number of snapshot writes this document has received
    pub write_count: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed size as stored
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(document_id: Uuid, kind: DocumentKind) -> Self {
        let now = unix_now();
        Self {
            document_id,
            kind,
            write_count: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// RocksDB-backed [`SnapshotStore`].
///
/// LZ4-compressed blobs, bloom filters for fast key lookup, a block cache
/// for hot documents, and atomic write batches so a snapshot and its
/// metadata never diverge.
pub struct RocksStore {
    /// Single-threaded mode — concurrency is handled by callers' tasks
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if absent.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Column family options: point-lookup workload, LZ4 on disk.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Persist a snapshot tagged with its document kind.
    ///
    /// The trait's `write_snapshot` keeps whatever kind the document was
    /// first tagged with (defaulting to `File`); hosts that know better call
    /// this directly.
    pub fn save_snapshot(
        &self,
        document_id: Uuid,
        kind: DocumentKind,
        content: &[u8],
    ) -> Result<SnapshotMetadata, StoreError> {
        let compressed = lz4_flex::compress_prepend_size(content);

        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = document_id.as_bytes().to_vec();

        let mut meta = match self.db.get_cf(&cf_meta, &key)? {
            Some(bytes) => SnapshotMetadata::decode(&bytes)?,
            None => SnapshotMetadata::new(document_id, kind),
        };
        meta.write_count += 1;
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        // Atomic batch: blob + metadata together
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load and decompress a snapshot.
    pub fn load_snapshot(&self, document_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;

        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    /// Whether a snapshot exists for the document.
    pub fn exists(&self, document_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    /// Load a document's metadata.
    pub fn metadata(&self, document_id: Uuid) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;

        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn write_snapshot(&self, document_id: Uuid, content: &[u8]) -> Result<(), StoreError> {
        let kind = self
            .metadata(document_id)
            .map(|m| m.kind)
            .unwrap_or(DocumentKind::File);
        self.save_snapshot(document_id, kind, content)?;
        Ok(())
    }

    fn read_snapshot(&self, document_id: Uuid) -> Result<Vec<u8>, StoreError> {
        self.load_snapshot(document_id)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
