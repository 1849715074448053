//! Document persistence: snapshot + append-only operation log.
//!
//! Two logical collections back every document:
//! ```text
//! ┌────────────────────────────┐   ┌─────────────────────────────────┐
//! │ documents                  │   │ operations                      │
//! │  doc_id → snapshot,version │   │  (doc_id, version) → delta, who │
//! └────────────────────────────┘   └─────────────────────────────────┘
//! ```
//!
//! The store's one concurrency primitive is the version gate: `commit`
//! mutates the snapshot only when the stored version still equals the
//! caller's expectation, otherwise it reports a conflict and changes
//! nothing. Everything above (locks, retries) is an optimization; this
//! gate is the correctness backstop.
//!
//! Implementations are injected so tests can run against [`MemoryStore`]
//! while deployments use [`RocksStore`].

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use scribe_ot::Delta;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// A document's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub title: String,
    /// The full content as an insert-only delta.
    pub content: Delta,
    /// Incremented by exactly one per committed op; 0 for a newborn
    /// document, and always equal to the highest log version.
    pub version: u64,
    pub created_by: String,
    pub collaborators: Vec<String>,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentRecord {
    /// A newborn document: version 0, empty content.
    pub fn new(title: impl Into<String>, owner: impl Into<String>, collaborators: Vec<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: Delta::new(),
            version: 0,
            created_by: owner.into(),
            collaborators,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` may open this document.
    pub fn allows(&self, user_id: &str) -> bool {
        self.created_by == user_id || self.collaborators.iter().any(|c| c == user_id)
    }
}

/// One committed operation. Immutable once written; `version` is the
/// document version AFTER the op applied, so the first committed op is
/// version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub doc_id: Uuid,
    pub version: u64,
    /// The delta actually composed into the snapshot (post-transform).
    pub delta: Delta,
    pub user_id: String,
    pub conn_id: Uuid,
    /// Seconds since epoch.
    pub timestamp: u64,
}

/// Result of the version-gated snapshot update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The gate matched; snapshot and version advanced.
    Committed,
    /// Another writer advanced the version first; nothing changed.
    Conflict,
}

/// Result of appending to the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry with this `(doc_id, version)` already exists; nothing
    /// changed. Idempotent-retry path, not a failure.
    Duplicate,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (RocksDB, I/O).
    DatabaseError(String),
    /// Document does not exist.
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
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

/// The snapshot + log contract. Calls are synchronous; callers on the
/// async side treat each call as a suspension point and hold no guard
/// across it.
pub trait DocumentStore: Send + Sync {
    /// Current snapshot and version.
    fn load(&self, doc_id: Uuid) -> Result<DocumentRecord, StoreError>;

    /// Log entries with `version > from_version`, ascending.
    fn ops_since(&self, doc_id: Uuid, from_version: u64) -> Result<Vec<OpLogEntry>, StoreError>;

    /// Version-gated snapshot update. Contract: `new_version` is
    /// `expected_version + 1`; the update happens atomically and only if
    /// the stored version equals `expected_version`.
    fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError>;

    /// Append-only log write, unique on `(doc_id, version)`.
    fn append_log(&self, entry: &OpLogEntry) -> Result<AppendOutcome, StoreError>;

    /// Bootstrap used by the (otherwise external) metadata surface and by
    /// tests: persist a newborn document.
    fn create_document(&self, record: &DocumentRecord) -> Result<(), StoreError>;
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
