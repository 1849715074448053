//! The serialized write path: transform, compose, version-gated commit.
//!
//! ```text
//! send-op(delta, base_version)
//!        │
//!        ▼
//! ┌─ load snapshot ──────────────────────────────┐
//! │  base_version > current?  → VersionAhead     │
//! │  base_version < current?  → transform through│
//! │                             ops_since(base)  │
//! │  compose into new snapshot                   │
//! │  commit(expected = current) ── Conflict ─────┼──► retry (≤ 5)
//! │        │ Committed                           │
//! │  append_log (Duplicate == success)           │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!   { transformed delta, new version }
//! ```
//!
//! Conflicts are control flow: a concurrent writer won the gate, so the
//! loop reloads and re-transforms. The distributed lock held by the
//! session makes that rare; the gate makes it safe.

use std::sync::Arc;
use uuid::Uuid;

use crate::store::{
    epoch_secs, AppendOutcome, CommitOutcome, DocumentStore, OpLogEntry, StoreError,
};
use scribe_ot::{transform_through, Delta, OtError};

/// Commit attempts before giving up on a contended document.
pub const MAX_COMMIT_RETRIES: usize = 5;

/// A successfully applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    /// The delta actually composed into the snapshot; this is what peers
    /// receive and what the log records.
    pub delta: Delta,
    /// The document version after this op.
    pub version: u64,
}

/// Write-path errors.
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Document does not exist.
    NotFound(Uuid),
    /// The client claims a version the server has not reached: corrupt or
    /// replaying client state. Not retriable; the client must resync.
    VersionAhead { client: u64, current: u64 },
    /// The commit retry budget ran out.
    TooMuchContention { attempts: usize },
    /// The delta does not fit the document it targets.
    MalformedDelta(OtError),
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotFound(id) => write!(f, "document not found: {id}"),
            ServiceError::VersionAhead { client, current } => write!(
                f,
                "client version {client} is ahead of document version {current}"
            ),
            ServiceError::TooMuchContention { attempts } => {
                write!(f, "commit failed after {attempts} attempts; document too contended")
            }
            ServiceError::MalformedDelta(e) => write!(f, "malformed delta: {e}"),
            ServiceError::Store(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

impl From<OtError> for ServiceError {
    fn from(e: OtError) -> Self {
        ServiceError::MalformedDelta(e)
    }
}

/// The per-document write path over an injected store.
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Apply one client operation: transform it past everything committed
    /// since the client's base version, commit through the version gate,
    /// append to the log, and return the transformed delta.
    pub fn apply_operation(
        &self,
        doc_id: Uuid,
        client_delta: &Delta,
        client_version: u64,
        user_id: &str,
        conn_id: Uuid,
    ) -> Result<AppliedOp, ServiceError> {
        for attempt in 1..=MAX_COMMIT_RETRIES {
            let doc = self.store.load(doc_id)?;
            let current_version = doc.version;

            if client_version > current_version {
                return Err(ServiceError::VersionAhead {
                    client: client_version,
                    current: current_version,
                });
            }

            let transformed = if client_version < current_version {
                let missed = self.store.ops_since(doc_id, client_version)?;
                let deltas: Vec<Delta> = missed.into_iter().map(|e| e.delta).collect();
                transform_through(client_delta, &deltas)
            } else {
                client_delta.clone()
            };

            let new_content = doc.content.apply(&transformed)?;
            let new_version = current_version + 1;

            match self
                .store
                .commit(doc_id, current_version, &new_content, new_version)?
            {
                CommitOutcome::Conflict => {
                    // Another writer advanced the version; reload and
                    // re-transform against what it committed.
                    log::debug!(
                        "commit conflict on {doc_id} at v{current_version} (attempt {attempt})"
                    );
                    continue;
                }
                CommitOutcome::Committed => {
                    let entry = OpLogEntry {
                        doc_id,
                        version: new_version,
                        delta: transformed.clone(),
                        user_id: user_id.to_string(),
                        conn_id,
                        timestamp: epoch_secs(),
                    };
                    if let AppendOutcome::Duplicate = self.store.append_log(&entry)? {
                        // A retried write already recorded this version.
                        log::debug!("log entry ({doc_id}, v{new_version}) already present");
                    }
                    return Ok(AppliedOp {
                        delta: transformed,
                        version: new_version,
                    });
                }
            }
        }

        log::warn!("giving up on {doc_id} after {MAX_COMMIT_RETRIES} commit conflicts");
        Err(ServiceError::TooMuchContention {
            attempts: MAX_COMMIT_RETRIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentRecord, MemoryStore};

    fn service_with_doc() -> (DocumentService, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let record = DocumentRecord::new("notes", "alice", vec![]);
        let id = record.id;
        store.create_document(&record).unwrap();
        (DocumentService::new(store), id)
    }

    #[test]
    fn test_single_writer_append() {
        let (service, id) = service_with_doc();
        let applied = service
            .apply_operation(id, &Delta::new().insert("Hello"), 0, "alice", Uuid::new_v4())
            .unwrap();
        assert_eq!(applied.version, 1);
        assert_eq!(applied.delta, Delta::new().insert("Hello"));

        let doc = service.store().load(id).unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.content.text(), "Hello");
    }

    #[test]
    fn test_stale_base_version_transforms() {
        let (service, id) = service_with_doc();
        let conn = Uuid::new_v4();
        service
            .apply_operation(id, &Delta::new().insert("A"), 0, "alice", conn)
            .unwrap();

        // B was composed against version 0 and arrives late.
        let applied = service
            .apply_operation(id, &Delta::new().insert("B"), 0, "bob", conn)
            .unwrap();
        assert_eq!(applied.version, 2);
        assert_eq!(applied.delta, Delta::new().retain(1).insert("B"));
        assert_eq!(service.store().load(id).unwrap().content.text(), "AB");
    }

    #[test]
    fn test_version_ahead_rejected() {
        let (service, id) = service_with_doc();
        let err = service
            .apply_operation(id, &Delta::new().insert("x"), 7, "alice", Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::VersionAhead {
                client: 7,
                current: 0
            }
        ));
    }

    #[test]
    fn test_missing_document_rejected() {
        let service = DocumentService::new(Arc::new(MemoryStore::new()));
        let err = service
            .apply_operation(
                Uuid::new_v4(),
                &Delta::new().insert("x"),
                0,
                "alice",
                Uuid::new_v4(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn test_malformed_delta_rejected() {
        let (service, id) = service_with_doc();
        // Retains past the end of an empty document.
        let err = service
            .apply_operation(
                id,
                &Delta::new().retain(10).insert("x"),
                0,
                "alice",
                Uuid::new_v4(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedDelta(_)));
    }

    #[test]
    fn test_log_fold_reconstructs_snapshot() {
        let (service, id) = service_with_doc();
        let conn = Uuid::new_v4();
        service
            .apply_operation(id, &Delta::new().insert("Hello"), 0, "alice", conn)
            .unwrap();
        service
            .apply_operation(id, &Delta::new().retain(5).insert(" world"), 1, "alice", conn)
            .unwrap();
        service
            .apply_operation(id, &Delta::new().delete(1).insert("J"), 1, "bob", conn)
            .unwrap();

        let doc = service.store().load(id).unwrap();
        let log = service.store().ops_since(id, 0).unwrap();

        // Versions are contiguous from 1 and unique.
        let versions: Vec<u64> = log.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(doc.version, 3);

        // Folding the log from empty reproduces the snapshot.
        let folded = log
            .iter()
            .fold(Delta::new(), |acc, entry| acc.compose(&entry.delta));
        assert_eq!(folded, doc.content);
    }
}
