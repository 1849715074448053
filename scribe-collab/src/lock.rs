//! Per-document distributed mutex with owner tokens and TTL.
//!
//! The lock is an optimization, not a correctness mechanism: it keeps
//! concurrent writers from burning commit retries against the version
//! gate. Losing it (TTL expiry mid-write, acquisition timeout) degrades
//! the write path to pure optimistic concurrency, which stays correct.
//!
//! Semantics match the classic "SET key owner NX PX ttl" +
//! compare-and-delete pair: acquisition is set-if-absent-with-expiry,
//! release only succeeds for the stored owner token, so a stale owner
//! whose TTL already lapsed cannot free a lock someone else now holds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lock acquisition tuning.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a held lock survives without release.
    pub ttl: Duration,
    /// Hard deadline for the acquisition spin.
    pub acquire_deadline: Duration,
    /// Pause between acquisition attempts.
    pub spin_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            acquire_deadline: Duration::from_secs(3),
            spin_interval: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Tight timings so contention tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            ttl: Duration::from_millis(200),
            acquire_deadline: Duration::from_millis(100),
            spin_interval: Duration::from_millis(5),
        }
    }
}

/// The distributed-mutex contract.
pub trait LockService: Send + Sync {
    /// Atomic set-if-absent-with-expiry. Returns `true` only if the
    /// caller now holds the lock.
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool;

    /// Atomic compare-and-delete. Releases only if the stored owner token
    /// equals `owner`; returns whether a release happened.
    fn release(&self, key: &str, owner: &str) -> bool;
}

/// Lock key for a document's write path.
pub fn doc_lock_key(doc_id: Uuid) -> String {
    format!("lock:doc:{doc_id}")
}

/// Spin `try_acquire` until success or the configured deadline.
///
/// Returns whether the lock was won. Callers proceed either way; a `false`
/// just means optimistic-only mode for this write.
pub async fn acquire_with_deadline(
    locks: &dyn LockService,
    key: &str,
    owner: &str,
    config: &LockConfig,
) -> bool {
    let deadline = Instant::now() + config.acquire_deadline;
    loop {
        if locks.try_acquire(key, owner, config.ttl) {
            return true;
        }
        if Instant::now() >= deadline {
            log::debug!("lock {key} not acquired before deadline; continuing optimistically");
            return false;
        }
        tokio::time::sleep(config.spin_interval).await;
    }
}

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Process-local [`LockService`].
///
/// A held key is one whose entry exists and has not expired; expired
/// entries count as absent, exactly like a TTL'd key that lapsed.
#[derive(Default)]
pub struct MemoryLockService {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held (test observability).
    pub fn is_held(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now())
    }
}

impl LockService for MemoryLockService {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return false;
            }
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    fn release(&self, key: &str, owner: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(existing) if existing.owner == owner => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}
