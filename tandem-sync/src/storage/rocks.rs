//! RocksDB-backed persistent store.
//!
//! Column families:
//! - `snapshots` — latest snapshot per document (LZ4 compressed JSON)
//! - `ops`       — op log (LZ4 compressed JSON, keyed by doc key + version)
//! - `metadata`  — per-document metadata (bincode)
//!
//! Keys: `<collection>\0<id>` for snapshots and metadata,
//! `<collection>\0<id>\0<v:8 bytes big-endian>` for ops, so a prefix scan
//! returns a document's ops in version order.

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{finish_query, matches_query, Store, StoreError};
use crate::op::{Op, Snapshot};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
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

/// Stored next to every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub collection: String,
    pub id: String,
    /// Version of the stored snapshot
    pub version: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(collection: &str, id: &str) -> Self {
        let now = now_secs();
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            version: 0,
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable [`Store`].
///
/// RocksDB calls are synchronous and short; they run inline on the calling
/// task. Commits are serialized by `commit_lock` so the version check and
/// the batch write are atomic with respect to each other.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Opens (or creates) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
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

        Ok(Self {
            db,
            config,
            commit_lock: Mutex::new(()),
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

        // Payloads are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                // Many small appends, prefix-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn load_metadata(&self, collection: &str, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(collection, id))? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn read_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, doc_key(collection, id))? {
            Some(bytes) => decode_json(&bytes),
            None => Ok(Snapshot::empty(id)),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn get_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, StoreError> {
        self.read_snapshot(collection, id)
    }

    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = op_prefix(collection, id);
        let start = op_key(collection, id, from);

        let mut ops = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let op: Op = decode_json(&value)?;
            if to.is_some_and(|to| op.v >= to) {
                break;
            }
            ops.push(op);
        }

        if let Some(to) = to {
            let reached = from + ops.len() as u64;
            if from < to && reached < to {
                return Err(StoreError::MissingOps { from: reached, to });
            }
        }
        Ok(ops)
    }

    async fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, StoreError> {
        let _guard = self.commit_lock.lock();

        let mut meta = self
            .load_metadata(collection, id)?
            .unwrap_or_else(|| DocumentMetadata::new(collection, id));
        if op.v != meta.version || snapshot.v != op.v + 1 {
            return Ok(false);
        }

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = doc_key(collection, id);
        let compressed = encode_json(snapshot)?;
        meta.version = snapshot.v;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, op_key(collection, id, op.v), encode_json(op)?);
        batch.put_cf(cf_snapshots, &key, &compressed);
        batch.put_cf(cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(true)
    }

    async fn query(&self, collection: &str, query: &Value) -> Result<Vec<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut prefix = collection.as_bytes().to_vec();
        prefix.push(0);

        let mut results = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let snapshot: Snapshot = decode_json(&value)?;
            if matches_query(&snapshot, query) {
                results.push(snapshot);
            }
        }
        Ok(finish_query(results, query))
    }
}

fn doc_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + id.len() + 1);
    key.extend_from_slice(collection.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn op_prefix(collection: &str, id: &str) -> Vec<u8> {
    let mut key = doc_key(collection, id);
    key.push(0);
    key
}

/// Doc key + version (8 bytes big-endian).
fn op_key(collection: &str, id: &str, v: u64) -> Vec<u8> {
    let mut key = op_prefix(collection, id);
    key.extend_from_slice(&v.to_be_bytes());
    key
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

fn now_secs() -> u64 {
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
