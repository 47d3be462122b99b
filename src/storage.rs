//! RocksDB-backed persistence: change log, snapshots, keychain.
//!
//! One database per `{base_dir}/{database_name}`, column families per record
//! kind:
//! - `changes`   — append-only change log (LZ4, keyed by namespace:seq)
//! - `snapshots` — full document state (LZ4), written on close as a
//!                 recovery shortcut
//! - `metadata`  — per-document bookkeeping (bincode)
//! - `keychain`  — documentId → key pair; enumerating it yields the known
//!                 document ids
//!
//! The keychain's public key doubles as the storage namespace and, hex
//! encoded, as the discovery key advertised to the signal server. Change
//! keys are `[public_key (32)][seq (8, BE)]` so a forward iterator replays
//! one document's log in insertion order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::protocol::Change;

const CF_CHANGES: &str = "changes";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const CF_KEYCHAIN: &str = "keychain";

const COLUMN_FAMILIES: &[&str] = &[CF_CHANGES, CF_SNAPSHOTS, CF_METADATA, CF_KEYCHAIN];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreOptions {
    /// Config for testing: small caches, caller-provided temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-document key material, persisted in the keychain.
///
/// Derived deterministically from the document id: every peer of a document
/// arrives at the same public key, which is what lets the signal server
/// match their interests without learning the document id itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
}

impl KeyPair {
    pub fn derive(document_id: &str) -> Self {
        let secret_key = hash_with_tag(b"TANDEM_SECRET_V1", document_id.as_bytes());
        let public_key = hash_with_tag(b"TANDEM_PUBLIC_V1", &secret_key);
        Self {
            public_key,
            secret_key,
        }
    }

    /// The identifier advertised to the signal server for this document.
    pub fn discovery_key(&self) -> String {
        hex::encode(self.public_key)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (keys, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(keys)
    }
}

/// Per-document bookkeeping stored alongside the change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Number of changes appended so far; also the next sequence number.
    pub change_count: u64,
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
    fn new(document_id: &str) -> Self {
        let now = unix_seconds();
        Self {
            document_id: document_id.to_string(),
            change_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
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

fn hash_with_tag(tag: &[u8], input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    MissingColumnFamily(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::Compression(e) => write!(f, "compression error: {e}"),
            Self::MissingColumnFamily(name) => write!(f, "missing column family: {name}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed change store for one database.
pub struct ChangeStore {
    db: DBWithThreadMode<SingleThreaded>,
    options: StoreOptions,
}

impl ChangeStore {
    /// Open (or create) the store at the configured path.
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(options.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &options)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &options.path,
            cf_descriptors,
        )?;

        Ok(Self { db, options })
    }

    fn cf_options(name: &str, options: &StoreOptions) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(options.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(options.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(options.write_buffer_size);

        match name {
            CF_CHANGES => {
                // Many small appends, prefix-scanned by namespace.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(32));
            }
            CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(options.block_cache_size as u64);
            }
            CF_METADATA | CF_KEYCHAIN => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(options.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.options.sync_writes);
        write_opts
    }

    // ─── Keychain ─────────────────────────────────────────────────────

    /// Fetch the key pair for a document, generating and persisting one on
    /// first use.
    pub fn keys_for(&self, document_id: &str) -> Result<KeyPair, StoreError> {
        let cf = self.cf(CF_KEYCHAIN)?;
        if let Some(bytes) = self.db.get_cf(cf, document_id.as_bytes())? {
            return KeyPair::decode(&bytes);
        }
        let keys = KeyPair::derive(document_id);
        self.db
            .put_cf_opt(cf, document_id.as_bytes(), keys.encode()?, &self.write_opts())?;
        log::debug!("keychain: derived keys for document {document_id}");
        Ok(keys)
    }

    /// The discovery key advertised to the signal server for a document.
    pub fn discovery_key(&self, document_id: &str) -> Result<String, StoreError> {
        Ok(self.keys_for(document_id)?.discovery_key())
    }

    /// Every document id this database has keys for.
    pub fn known_document_ids(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_KEYCHAIN)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => ids.push(id),
                Err(_) => {
                    return Err(StoreError::Deserialization(
                        "non-UTF-8 keychain entry".into(),
                    ))
                }
            }
        }
        Ok(ids)
    }

    // ─── Change log ───────────────────────────────────────────────────

    /// Append changes to a document's log. Returns the next sequence number.
    pub fn append_changes(
        &self,
        document_id: &str,
        changes: &[Change],
    ) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(self
                .metadata(document_id)?
                .map(|m| m.change_count)
                .unwrap_or(0));
        }
        let namespace = self.keys_for(document_id)?.public_key;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));

        let mut batch = WriteBatch::default();
        for change in changes {
            let key = change_key(&namespace, meta.change_count);
            let compressed = lz4_flex::compress_prepend_size(change.as_bytes());
            batch.put_cf(cf_changes, key, &compressed);
            meta.change_count += 1;
        }
        meta.updated_at = unix_seconds();
        batch.put_cf(cf_meta, namespace, meta.encode()?);

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(meta.change_count)
    }

    /// Replay a document's change log in insertion order.
    pub fn load_changes(&self, document_id: &str) -> Result<Vec<Change>, StoreError> {
        let namespace = self.keys_for(document_id)?.public_key;
        let cf = self.cf(CF_CHANGES)?;

        let start_key = change_key(&namespace, 0);
        let mut changes = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 40 || key[..32] != namespace {
                break;
            }
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            changes.push(Change::new(bytes));
        }
        Ok(changes)
    }

    /// Delete log entries below `up_to_seq` once a snapshot covers them.
    pub fn compact_changes(&self, document_id: &str, up_to_seq: u64) -> Result<u64, StoreError> {
        let namespace = self.keys_for(document_id)?.public_key;
        let cf = self.cf(CF_CHANGES)?;

        let start_key = change_key(&namespace, 0);
        let end_key = change_key(&namespace, up_to_seq);
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 40 || key[..32] != namespace || key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full-state snapshot (LZ4 compressed).
    pub fn save_snapshot(
        &self,
        document_id: &str,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let namespace = self.keys_for(document_id)?.public_key;
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snaps, namespace, &compressed);
        batch.put_cf(cf_meta, namespace, meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(meta)
    }

    /// Load the latest snapshot, if one was ever written.
    pub fn load_snapshot(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let namespace = self.keys_for(document_id)?.public_key;
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, namespace)? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let namespace = self.keys_for(document_id)?.public_key;
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, namespace)? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn change_key(namespace: &[u8; 32], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(namespace);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}
