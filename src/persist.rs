//! Persistence gateway and storage abstraction.
//!
//! The [`KvStore`] trait models an external byte-oriented key-value store
//! (browser local storage, a file per key, an in-memory map): `get` returns
//! bytes, `set` fails with a distinguishable quota-exceeded error.
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! The [`PersistenceGateway`] sits between the engine and the store:
//! mutations re-arm a trailing-edge debounce window so bursts coalesce into
//! one write, saves serialize the versioned snapshot plus a legacy view of
//! active shards, and failures surface as a sticky, user-visible
//! [`StorageError`] instead of propagating. A later successful write clears
//! the flag.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use crate::migrate;
use crate::models::Snapshot;

/// Key holding the versioned snapshot.
pub const SNAPSHOT_KEY: &str = "collectio.snapshot.v2";
/// Key holding the simplified legacy view (active shards only), kept for
/// older snapshot readers.
pub const LEGACY_KEY: &str = "collectio.shards";

/// Write failure reported by a [`KvStore`].
#[derive(Debug, Error)]
pub enum KvError {
    /// The store's capacity limit was exceeded.
    #[error("storage quota exceeded")]
    QuotaExceeded,
    /// Any other write failure.
    #[error("storage write failed: {0}")]
    Io(String),
}

/// Sticky, user-visible persistence failure state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageError {
    /// Recent changes may not survive a reload; free up space.
    QuotaExceeded,
    /// Generic persistence failure.
    WriteFailed,
}

/// Byte-oriented key-value store with a quota-exceeded failure mode.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
}

// ============ In-memory store ============

/// In-memory store for tests, with an optional total-byte quota.
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: RwLock<Option<usize>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: RwLock::new(None),
        }
    }

    /// Cap the total stored bytes; writes that would exceed it fail with
    /// [`KvError::QuotaExceeded`]. Pass `None` to lift the cap.
    pub fn set_quota(&self, bytes: Option<usize>) {
        *self.quota_bytes.write().unwrap() = bytes;
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let quota = *self.quota_bytes.read().unwrap();
        let mut entries = self.entries.write().unwrap();
        if let Some(limit) = quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if others + value.len() > limit {
                return Err(KvError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ============ File-backed store ============

/// One file per key under a data directory, with an optional per-value
/// quota mirroring the browser store's capacity limit.
pub struct FileKvStore {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileKvStore {
    pub fn new(dir: PathBuf, quota_bytes: Option<u64>) -> Self {
        Self { dir, quota_bytes }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are dotted identifiers; keep them filesystem-safe.
        let name: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(name)
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        if let Some(limit) = self.quota_bytes {
            if value.len() as u64 > limit {
                return Err(KvError::QuotaExceeded);
            }
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| KvError::Io(e.to_string()))?;
        let path = self.path_for(key);
        std::fs::write(&path, value).map_err(|e| KvError::Io(e.to_string()))
    }
}

// ============ Gateway ============

#[derive(Debug, Default)]
struct GatewayMeta {
    /// Trailing-edge debounce deadline; re-armed on every mutation.
    flush_at: Option<DateTime<Utc>>,
    storage_error: Option<StorageError>,
}

/// Durable save/load of the engine state with debouncing and quota-failure
/// recovery.
pub struct PersistenceGateway {
    kv: Arc<dyn KvStore>,
    debounce: Duration,
    meta: Mutex<GatewayMeta>,
}

impl PersistenceGateway {
    pub fn new(kv: Arc<dyn KvStore>, debounce: Duration) -> Self {
        Self {
            kv,
            debounce,
            meta: Mutex::new(GatewayMeta::default()),
        }
    }

    /// Note a Store/Ledger mutation, re-arming the debounce window so rapid
    /// bursts coalesce into a single write.
    pub fn mark_dirty(&self, now: DateTime<Utc>) {
        self.meta.lock().unwrap().flush_at = Some(now + self.debounce);
    }

    /// When the pending write should happen, if one is pending.
    pub fn next_flush_at(&self) -> Option<DateTime<Utc>> {
        self.meta.lock().unwrap().flush_at
    }

    /// True when a pending write's debounce window has elapsed.
    pub fn flush_due(&self, now: DateTime<Utc>) -> bool {
        self.meta
            .lock()
            .unwrap()
            .flush_at
            .is_some_and(|at| at <= now)
    }

    /// The sticky persistence failure state, if any.
    pub fn storage_error(&self) -> Option<StorageError> {
        self.meta.lock().unwrap().storage_error.clone()
    }

    /// Serialize and write the snapshot plus the legacy view.
    ///
    /// Never returns an error: failures become the sticky [`StorageError`]
    /// read model and in-memory state is left untouched. A successful write
    /// clears any previously raised flag.
    pub async fn save(&self, snapshot: &Snapshot) {
        self.meta.lock().unwrap().flush_at = None;

        let full = match serde_json::to_vec(snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot serialization failed");
                self.meta.lock().unwrap().storage_error = Some(StorageError::WriteFailed);
                return;
            }
        };
        let active: Vec<_> = snapshot.shards.iter().filter(|s| s.is_active()).collect();
        let legacy = match serde_json::to_vec(&active) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "legacy view serialization failed");
                self.meta.lock().unwrap().storage_error = Some(StorageError::WriteFailed);
                return;
            }
        };

        let result = async {
            self.kv.set(SNAPSHOT_KEY, full).await?;
            self.kv.set(LEGACY_KEY, legacy).await
        }
        .await;

        let mut meta = self.meta.lock().unwrap();
        match result {
            Ok(()) => {
                meta.storage_error = None;
                tracing::debug!(
                    shards = snapshot.shards.len(),
                    "snapshot persisted"
                );
            }
            Err(KvError::QuotaExceeded) => {
                tracing::warn!("snapshot write hit the storage quota");
                meta.storage_error = Some(StorageError::QuotaExceeded);
            }
            Err(KvError::Io(e)) => {
                tracing::warn!(error = %e, "snapshot write failed");
                meta.storage_error = Some(StorageError::WriteFailed);
            }
        }
    }

    /// Load the persisted snapshot, upgrading the legacy format if needed.
    ///
    /// Called once at startup; format detection lives entirely in
    /// [`migrate`], so steady-state code only ever sees the canonical
    /// in-memory representation.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        if let Some(bytes) = self.kv.get(SNAPSHOT_KEY).await? {
            if let Some(snapshot) = migrate::decode_snapshot(&bytes) {
                return Ok(Some(snapshot));
            }
            tracing::warn!("versioned snapshot invalid, trying legacy format");
        }
        if let Some(bytes) = self.kv.get(LEGACY_KEY).await? {
            if let Some(snapshot) = migrate::upgrade_legacy(&bytes) {
                tracing::debug!(
                    shards = snapshot.shards.len(),
                    "hydrated from legacy snapshot"
                );
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }
}
