//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — full document records (JSON, LZ4 compressed)
//! - `oplog`     — operation log entries, keyed by `doc_id:version` for
//!   range replay
//!
//! Values are JSON: deltas carry arbitrary JSON attribute values, which a
//! non-self-describing codec cannot round-trip.
//!
//! The version gate rides on an internal commit mutex: RocksDB has no
//! native compare-and-set, so the read-check-write of `commit` runs under
//! one guard. Reads (`load`, `ops_since`) stay lock-free.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, MultiThreaded, Options, WriteOptions,
};
use scribe_ot::Delta;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    epoch_secs, AppendOutcome, CommitOutcome, DocumentRecord, DocumentStore, OpLogEntry, StoreError,
};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
    /// Serializes the read-check-write of `commit` and the
    /// check-then-put of `append_log`.
    write_gate: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("document store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_gate: Mutex::new(()),
        })
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
            CF_DOCUMENTS => {
                // Whole-record point lookups, frequent overwrites.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // Many small appends, prefix-scanned by doc_id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Key format: `doc_id (16 bytes) ‖ version (8 bytes big-endian)` so a
    /// forward iterator walks one document's log in version order.
    fn oplog_key(doc_id: Uuid, version: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(doc_id.as_bytes());
        key[16..].copy_from_slice(&version.to_be_bytes());
        key
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn load_record(&self, doc_id: Uuid) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }
}

impl DocumentStore for RocksStore {
    fn load(&self, doc_id: Uuid) -> Result<DocumentRecord, StoreError> {
        self.load_record(doc_id)
    }

    fn ops_since(&self, doc_id: Uuid, from_version: u64) -> Result<Vec<OpLogEntry>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start = Self::oplog_key(doc_id, from_version.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || key[..16] != doc_id.as_bytes()[..] {
                break; // Walked past this document's prefix.
            }
            entries.push(Self::decode::<OpLogEntry>(&value)?);
        }
        Ok(entries)
    }

    fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        debug_assert_eq!(new_version, expected_version + 1);
        let _gate = self.write_gate.lock().unwrap();

        let mut record = self.load_record(doc_id)?;
        if record.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        record.content = new_content.clone();
        record.version = new_version;
        record.updated_at = epoch_secs();

        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.put_cf_opt(
            &cf,
            doc_id.as_bytes(),
            Self::encode(&record)?,
            &self.write_opts(),
        )?;
        Ok(CommitOutcome::Committed)
    }

    fn append_log(&self, entry: &OpLogEntry) -> Result<AppendOutcome, StoreError> {
        let _gate = self.write_gate.lock().unwrap();

        let cf = self.cf(CF_OPLOG)?;
        let key = Self::oplog_key(entry.doc_id, entry.version);
        if self.db.get_cf(&cf, key)?.is_some() {
            return Ok(AppendOutcome::Duplicate);
        }
        self.db
            .put_cf_opt(&cf, key, Self::encode(entry)?, &self.write_opts())?;
        Ok(AppendOutcome::Appended)
    }

    fn create_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.put_cf_opt(
            &cf,
            record.id.as_bytes(),
            Self::encode(record)?,
            &self.write_opts(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (store, _dir) = open_temp();
        assert!(store.cf(CF_DOCUMENTS).is_ok());
        assert!(store.cf(CF_OPLOG).is_ok());
    }

    #[test]
    fn test_document_roundtrip() {
        let (store, _dir) = open_temp();
        let record = DocumentRecord::new("notes", "alice", vec!["bob".into()]);
        store.create_document(&record).unwrap();

        let loaded = store.load(record.id).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (store, _dir) = open_temp();
        assert!(matches!(
            store.load(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_oplog_key_orders_by_version() {
        let doc = Uuid::new_v4();
        let k1 = RocksStore::oplog_key(doc, 1);
        let k2 = RocksStore::oplog_key(doc, 2);
        let k256 = RocksStore::oplog_key(doc, 256);
        assert!(k1 < k2);
        assert!(k2 < k256); // Big-endian keeps numeric order.
    }

    #[test]
    fn test_commit_conflict_leaves_record() {
        let (store, _dir) = open_temp();
        let record = DocumentRecord::new("doc", "alice", vec![]);
        store.create_document(&record).unwrap();

        let first = Delta::new().insert("one");
        assert_eq!(
            store.commit(record.id, 0, &first, 1).unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            store
                .commit(record.id, 0, &Delta::new().insert("two"), 1)
                .unwrap(),
            CommitOutcome::Conflict
        );

        let loaded = store.load(record.id).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.content, first);
    }
}
