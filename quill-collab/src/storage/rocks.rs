//! RocksDB-backed note store.
//!
//! Column families:
//! - `snapshots` — latest full document encoding per note (LZ4 compressed)
//! - `versions`  — immutable version records, keyed by `note_id:version_be`
//! - `metadata`  — per-note bookkeeping (latest version number, sizes, times)
//!
//! Version numbers are allocated under a store-level mutex so they are
//! strictly increasing per note and never reused, even when the save path
//! and the collaborative throttle race.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_VERSIONS: &str = "versions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_VERSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — batched fsync)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for tests: small caches, caller-provided temp directory.
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

/// Per-note bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub note_id: Uuid,
    /// Highest version number allocated for this note (0 = none yet).
    pub latest_version: u64,
    /// Uncompressed size of the latest snapshot in bytes.
    pub snapshot_size: u64,
    /// Compressed size of the latest snapshot in bytes.
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch).
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch).
    pub updated_at: u64,
}

impl NoteMetadata {
    fn new(note_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            note_id,
            latest_version: 0,
            snapshot_size: 0,
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

/// An immutable, numbered content checkpoint, distinct from the live CRDT
/// state. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionRecord {
    pub note_id: Uuid,
    /// Strictly increasing per note, starting at 1.
    pub version_number: u64,
    pub title: String,
    pub content: String,
    pub author: Uuid,
    /// Free-form reason, e.g. "Auto-saved during collaboration".
    pub reason: String,
    /// Creation timestamp (seconds since epoch).
    pub created_at: u64,
}

impl VersionRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Note not found
    NotFound(Uuid),
    /// Version not found for a note
    VersionNotFound { note_id: Uuid, version: u64 },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Note not found: {id}"),
            StoreError::VersionNotFound { note_id, version } => {
                write!(f, "Version {version} not found for note {note_id}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed durable store for note snapshots and version history.
pub struct NoteStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes version-number allocation (read-modify-write on metadata).
    version_alloc: Mutex<()>,
}

impl NoteStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            version_alloc: Mutex::new(()),
        })
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
                // One large value per note, point-looked-up on room open.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-only, prefix-scanned by note id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    /// Persist the latest full document encoding (LZ4 compressed) together
    /// with refreshed metadata, atomically.
    pub fn save_snapshot(&self, note_id: Uuid, snapshot: &[u8]) -> Result<NoteMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .metadata(note_id)
            .unwrap_or_else(|_| NoteMetadata::new(note_id));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = note_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the latest document encoding (LZ4 decompressed).
    pub fn load_snapshot(&self, note_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, note_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(note_id)),
        }
    }

    /// Whether any state has ever been persisted for the note.
    pub fn note_exists(&self, note_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, note_id.as_bytes())?.is_some())
    }

    // ─── Version records ─────────────────────────────────────────────

    /// Materialize an immutable version record with the next strictly
    /// increasing number for this note.
    pub fn append_version(
        &self,
        note_id: Uuid,
        title: String,
        content: String,
        author: Uuid,
        reason: String,
    ) -> Result<VersionRecord, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        // Allocation is a read-modify-write on metadata: serialize it.
        let _guard = self
            .version_alloc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut meta = self
            .metadata(note_id)
            .unwrap_or_else(|_| NoteMetadata::new(note_id));
        let number = meta.latest_version + 1;
        meta.latest_version = number;
        meta.updated_at = unix_now();

        let record = VersionRecord {
            note_id,
            version_number: number,
            title,
            content,
            author,
            reason,
            created_at: meta.updated_at,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, Self::version_key(note_id, number), &record.encode()?);
        batch.put_cf(&cf_meta, note_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record)
    }

    /// Load one version record.
    pub fn load_version(&self, note_id: Uuid, version: u64) -> Result<VersionRecord, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, Self::version_key(note_id, version))? {
            Some(bytes) => VersionRecord::decode(&bytes),
            None => Err(StoreError::VersionNotFound { note_id, version }),
        }
    }

    /// All version records for a note, in version order.
    pub fn list_versions(&self, note_id: Uuid) -> Result<Vec<VersionRecord>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start_key = Self::version_key(note_id, 0);

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != note_id.as_bytes() {
                break;
            }
            records.push(VersionRecord::decode(&value)?);
        }
        Ok(records)
    }

    /// Highest version number allocated for a note (0 = none yet).
    pub fn latest_version_number(&self, note_id: Uuid) -> Result<u64, StoreError> {
        match self.metadata(note_id) {
            Ok(meta) => Ok(meta.latest_version),
            Err(StoreError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    // ─── Metadata ────────────────────────────────────────────────────

    /// Load per-note metadata.
    pub fn metadata(&self, note_id: Uuid) -> Result<NoteMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, note_id.as_bytes())? {
            Some(bytes) => NoteMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(note_id)),
        }
    }

    /// All note ids with persisted state.
    pub fn list_notes(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(key.as_ref().try_into().map_err(|_| {
                    StoreError::DeserializationError("Invalid UUID key".into())
                })?);
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Delete a note's snapshot, metadata and version history.
    pub fn delete_note(&self, note_id: Uuid) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_versions = self.cf(CF_VERSIONS)?;

        let key = note_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, &key);
        batch.delete_cf(&cf_meta, &key);

        let start_key = Self::version_key(note_id, 0);
        let iter = self.db.iterator_cf(
            &cf_versions,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != note_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_versions, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ─────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Version key: note_id (16 bytes) + version (8 bytes big-endian).
    fn version_key(note_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(note_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
