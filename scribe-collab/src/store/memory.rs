//! In-memory store for tests and single-process deployments.
//!
//! Same contract as the RocksDB store, held in two mutex-guarded maps.
//! The `commit` gate is trivially atomic: the check and the write happen
//! under one guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    epoch_secs, AppendOutcome, CommitOutcome, DocumentRecord, DocumentStore, OpLogEntry, StoreError,
};
use scribe_ot::Delta;

/// Map-backed [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<Uuid, DocumentRecord>>,
    /// Ordered by `(doc_id, version)` so range replay is a range scan,
    /// like the RocksDB key layout.
    operations: Mutex<BTreeMap<(Uuid, u64), OpLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    /// Total log entries across all documents.
    pub fn log_len(&self) -> usize {
        self.operations.lock().unwrap().len()
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, doc_id: Uuid) -> Result<DocumentRecord, StoreError> {
        self.documents
            .lock()
            .unwrap()
            .get(&doc_id)
            .cloned()
            .ok_or(StoreError::NotFound(doc_id))
    }

    fn ops_since(&self, doc_id: Uuid, from_version: u64) -> Result<Vec<OpLogEntry>, StoreError> {
        let operations = self.operations.lock().unwrap();
        Ok(operations
            .range((doc_id, from_version.saturating_add(1))..=(doc_id, u64::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        debug_assert_eq!(new_version, expected_version + 1);
        let mut documents = self.documents.lock().unwrap();
        let record = documents
            .get_mut(&doc_id)
            .ok_or(StoreError::NotFound(doc_id))?;
        if record.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        record.content = new_content.clone();
        record.version = new_version;
        record.updated_at = epoch_secs();
        Ok(CommitOutcome::Committed)
    }

    fn append_log(&self, entry: &OpLogEntry) -> Result<AppendOutcome, StoreError> {
        let mut operations = self.operations.lock().unwrap();
        let key = (entry.doc_id, entry.version);
        if operations.contains_key(&key) {
            return Ok(AppendOutcome::Duplicate);
        }
        operations.insert(key, entry.clone());
        Ok(AppendOutcome::Appended)
    }

    fn create_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.documents
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }
}
