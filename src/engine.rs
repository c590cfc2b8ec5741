//! Engine facade over the shard store, undo ledger, and selection set.
//!
//! [`Collectio`] owns all mutable state behind a mutex and exposes the
//! command/query surface the UI layer drives. The lock is held only for
//! synchronous mutations, never across an `await`, so concurrent ingests
//! interleave like the single-threaded event loop the engine models:
//! the sequence slot is reserved under the lock before the first await,
//! classification runs unlocked, and the final status write goes by id,
//! so the last completing call wins.
//!
//! Time-sensitive operations (`sweep_expired`, `undo_delete`,
//! `undo_state`, `persist_if_due`) take an explicit `now` so a real timer,
//! a test harness, or a server loop can drive expiry identically. Drivers
//! arm a single timer from [`next_deadline`](Collectio::next_deadline) and
//! [`next_flush_at`](Collectio::next_flush_at), re-arming whenever either
//! changes and disarming when both are `None`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::compile::{self, create_curator, Curator};
use crate::config::Config;
use crate::hasher::{ContentHasher, Sha256Hasher};
use crate::indexer::{create_indexer, Indexer};
use crate::ledger::UndoLedger;
use crate::models::{
    Compilation, Shard, ShardMetadata, ShardStatus, Snapshot, UndoState, UsageTotals,
    SNAPSHOT_VERSION,
};
use crate::persist::{KvStore, PersistenceGateway, StorageError};
use crate::selection::SelectionSet;
use crate::store::{DomainGroup, ShardStore};

/// Outcome of an [`ingest`](Collectio::ingest) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new shard was admitted; its id is returned.
    Ingested(String),
    /// An active shard already holds this content; nothing was created.
    Duplicate,
    /// Empty or whitespace-only input; nothing was created.
    Empty,
}

struct State {
    store: ShardStore,
    ledger: UndoLedger,
    selection: SelectionSet,
    /// When the duplicate-detected signal was last raised.
    duplicate_at: Option<DateTime<Utc>>,
    usage: UsageTotals,
}

/// The knowledge shard store engine.
pub struct Collectio {
    state: Mutex<State>,
    gateway: PersistenceGateway,
    hasher: Arc<dyn ContentHasher>,
    indexer: Arc<dyn Indexer>,
    curator: Arc<dyn Curator>,
    undo_ttl: Duration,
    duplicate_signal: Duration,
}

impl Collectio {
    /// Build an engine with explicit collaborators.
    pub fn new(
        config: &Config,
        kv: Arc<dyn KvStore>,
        hasher: Arc<dyn ContentHasher>,
        indexer: Arc<dyn Indexer>,
        curator: Arc<dyn Curator>,
    ) -> Self {
        let undo_ttl = config.lifecycle.undo_ttl();
        Self {
            state: Mutex::new(State {
                store: ShardStore::new(),
                ledger: UndoLedger::new(undo_ttl),
                selection: SelectionSet::new(),
                duplicate_at: None,
                usage: UsageTotals::default(),
            }),
            gateway: PersistenceGateway::new(kv, config.lifecycle.debounce()),
            hasher,
            indexer,
            curator,
            undo_ttl,
            duplicate_signal: config.lifecycle.duplicate_signal(),
        }
    }

    /// Build an engine with the configured providers and the SHA-256 hasher.
    pub fn from_config(config: &Config, kv: Arc<dyn KvStore>) -> Result<Self> {
        let indexer = create_indexer(&config.indexer)?;
        let curator = create_curator(&config.curator)?;
        Ok(Self::new(config, kv, Arc::new(Sha256Hasher), indexer, curator))
    }

    // ───── lifecycle ─────────────────────────────────────────────────

    /// Hydrate from the persisted snapshot, then sweep transactions that
    /// expired while the process was down.
    pub async fn hydrate(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(snapshot) = self.gateway.load().await? {
            let mut guard = self.state.lock().unwrap();
            guard.store = ShardStore::from_parts(snapshot.shards, snapshot.next_ingest_seq);
            guard.ledger = UndoLedger::from_parts(snapshot.undo_transactions, self.undo_ttl);
            guard.selection = SelectionSet::new();
        }
        self.sweep_expired(now);
        Ok(())
    }

    /// Ingest a text fragment.
    ///
    /// The sequence slot is reserved synchronously, before the hash is
    /// awaited, so bursts of concurrent calls keep call order. Content whose
    /// hash matches an active shard raises the duplicate signal and creates
    /// nothing.
    pub async fn ingest(&self, content: &str) -> Result<IngestOutcome> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let seq = self.state.lock().unwrap().store.reserve_seq();
        let hash = self.hasher.hash(trimmed).await?;

        let now = Utc::now();
        let (id, domains) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            if state.store.has_active_hash(&hash) {
                state.duplicate_at = Some(now);
                return Ok(IngestOutcome::Duplicate);
            }
            let id = Uuid::new_v4().to_string();
            state.store.insert(Shard {
                id: id.clone(),
                content: trimmed.to_string(),
                content_hash: hash,
                ingest_seq: seq,
                token_count: crate::models::estimate_tokens(trimmed),
                timestamp: now,
                status: ShardStatus::Pending,
                metadata: None,
                error: None,
                deleted_at: None,
                deleted_tx_id: None,
            });
            // Admitted: indexing starts immediately.
            if let Some(shard) = state.store.get_mut(&id) {
                shard.status = ShardStatus::Indexing;
            }
            self.gateway.mark_dirty(now);
            (id, state.store.known_domains())
        };

        self.classify_into(&id, trimmed, &domains).await;
        Ok(IngestOutcome::Ingested(id))
    }

    /// Re-run classification for a shard, typically one in `error`.
    ///
    /// Returns false for unknown or soft-deleted shards. Concurrent retries
    /// are not guarded: each completion updates by id, so the last one wins.
    pub async fn retry(&self, id: &str) -> Result<bool> {
        let (content, domains) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let content = match state.store.get_mut(id) {
                Some(shard) if shard.is_active() => {
                    shard.status = ShardStatus::Indexing;
                    shard.error = None;
                    shard.content.clone()
                }
                _ => return Ok(false),
            };
            self.gateway.mark_dirty(Utc::now());
            (content, state.store.known_domains())
        };

        self.classify_into(id, &content, &domains).await;
        Ok(true)
    }

    async fn classify_into(&self, id: &str, content: &str, domains: &[String]) {
        let result = self.indexer.classify(content, domains).await;
        let now = Utc::now();

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match result {
            Ok(classification) => {
                state.usage.record(classification.usage);
                if let Some(shard) = state.store.get_mut(id) {
                    shard.status = ShardStatus::Ready;
                    shard.metadata = Some(ShardMetadata {
                        title: classification.title,
                        domain: classification.domain,
                        synopsis: classification.synopsis,
                        tags: classification.tags,
                    });
                    shard.error = None;
                }
            }
            Err(e) => {
                tracing::debug!(shard = id, error = %e, "classification failed");
                if let Some(shard) = state.store.get_mut(id) {
                    shard.status = ShardStatus::Error;
                    shard.error = Some(e.to_string());
                }
            }
        }
        self.gateway.mark_dirty(now);
    }

    // ───── deletion & undo ───────────────────────────────────────────

    /// Soft-delete one shard under a fresh undo transaction.
    pub fn delete_shard(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.store.get(id) {
            Some(shard) if shard.is_active() => {}
            _ => return false,
        }
        let tx_id = state.ledger.open(
            crate::models::UndoKind::DeleteOne,
            vec![id.to_string()],
            now,
        );
        state.store.soft_delete(id, &tx_id, now);
        state.selection.remove(id);
        self.gateway.mark_dirty(now);
        true
    }

    /// Soft-delete every active shard under one undo transaction.
    ///
    /// Returns the number of shards deleted; 0 means there was nothing to
    /// clear and no transaction was opened.
    pub fn clear_all(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let ids = state.store.active_ids();
        if ids.is_empty() {
            return 0;
        }
        let tx_id = state
            .ledger
            .open(crate::models::UndoKind::ClearAll, ids.clone(), now);
        for id in &ids {
            state.store.soft_delete(id, &tx_id, now);
        }
        state.selection.deselect_all();
        self.gateway.mark_dirty(now);
        ids.len()
    }

    /// Reverse the most recent open, unexpired transaction.
    ///
    /// Restoration is conditional: a shard comes back only if no currently
    /// active shard shares its content hash (the same content may have been
    /// re-ingested while it was soft-deleted). Conflicting shards are
    /// dropped rather than producing a duplicate pair. Returns the number
    /// of shards restored; 0 when there is nothing to undo.
    pub fn undo_delete(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let tx = match state.ledger.latest_open(now) {
            Some(tx) => tx.clone(),
            None => return 0,
        };

        let mut restored = 0;
        for id in &tx.shard_ids {
            let hash = match state.store.get(id) {
                Some(shard) if !shard.is_active() => shard.content_hash.clone(),
                _ => continue,
            };
            if state.store.has_active_hash(&hash) {
                tracing::debug!(shard = id.as_str(), "undo conflict, dropping shard");
                state.store.remove(id);
            } else {
                state.store.restore(id);
                restored += 1;
            }
        }
        state.ledger.mark_undone(&tx.id);
        Self::prune_ledger(state);
        self.gateway.mark_dirty(now);
        restored
    }

    /// Expire overdue transactions and hard-remove their shards.
    ///
    /// Idempotent and safe to invoke redundantly; drivers call it whenever
    /// the deadline from [`next_deadline`](Self::next_deadline) fires.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let expired = state.ledger.tick(now);
        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for tx in &expired {
            for id in &tx.shard_ids {
                let still_deleted = state.store.get(id).is_some_and(|s| {
                    !s.is_active() && s.deleted_tx_id.as_deref() == Some(tx.id.as_str())
                });
                if still_deleted {
                    state.store.remove(id);
                    state.selection.remove(id);
                    removed += 1;
                }
            }
        }
        Self::prune_ledger(state);
        self.gateway.mark_dirty(now);
        tracing::debug!(removed, "expiry sweep completed");
        removed
    }

    fn prune_ledger(state: &mut State) {
        let referenced: HashSet<String> = state
            .store
            .shards()
            .iter()
            .filter_map(|s| s.deleted_tx_id.clone())
            .collect();
        state.ledger.prune_resolved(&referenced);
    }

    /// Nearest undo-expiry deadline, for the driver's single timer.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().ledger.next_deadline()
    }

    /// Undo affordance read model.
    pub fn undo_state(&self, now: DateTime<Utc>) -> UndoState {
        self.state.lock().unwrap().ledger.undo_state(now)
    }

    /// Whether the duplicate-detected signal is currently raised.
    ///
    /// The signal auto-clears once the configured window has passed.
    pub fn duplicate_flag(&self, now: DateTime<Utc>) -> bool {
        let mut guard = self.state.lock().unwrap();
        match guard.duplicate_at {
            Some(at) if now - at < self.duplicate_signal => true,
            Some(_) => {
                guard.duplicate_at = None;
                false
            }
            None => false,
        }
    }

    // ───── selection ─────────────────────────────────────────────────

    /// Flip selection membership for an active shard. No-op on unknown or
    /// soft-deleted ids. Returns true when selected afterwards.
    pub fn toggle_selection(&self, id: &str) -> bool {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.store.get(id) {
            Some(shard) if shard.is_active() => state.selection.toggle(id),
            _ => false,
        }
    }

    /// Select every active, ready shard.
    pub fn select_all(&self) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let eligible: Vec<String> = state
            .store
            .active()
            .filter(|s| s.is_ready())
            .map(|s| s.id.clone())
            .collect();
        state.selection.select_all(eligible);
    }

    pub fn deselect_all(&self) {
        self.state.lock().unwrap().selection.deselect_all();
    }

    pub fn selected_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().selection.ids()
    }

    // ───── queries ───────────────────────────────────────────────────

    /// Active shards in ingestion order.
    pub fn active_shards(&self) -> Vec<Shard> {
        let guard = self.state.lock().unwrap();
        let mut shards: Vec<Shard> = guard.store.active().cloned().collect();
        shards.sort_by_key(|s| s.ingest_seq);
        shards
    }

    /// Active shards grouped for display.
    pub fn display_groups(&self) -> Vec<DomainGroup> {
        self.state.lock().unwrap().store.display_groups()
    }

    pub fn shard(&self, id: &str) -> Option<Shard> {
        self.state.lock().unwrap().store.get(id).cloned()
    }

    /// Accumulated collaborator usage for this session.
    pub fn usage(&self) -> UsageTotals {
        self.state.lock().unwrap().usage
    }

    // ───── compilation ───────────────────────────────────────────────

    /// Compile the working set into a manifest and rendered document.
    ///
    /// A non-empty selection restricts the set to selected ready shards;
    /// otherwise every active ready shard compiles. Never fails.
    pub async fn compile(&self) -> Compilation {
        let working_set: Vec<Shard> = {
            let guard = self.state.lock().unwrap();
            let ordered = guard.store.compilation_order();
            if guard.selection.is_empty() {
                ordered.into_iter().cloned().collect()
            } else {
                ordered
                    .into_iter()
                    .filter(|s| guard.selection.contains(&s.id))
                    .cloned()
                    .collect()
            }
        };

        let (compilation, usage) = compile::compile(&working_set, self.curator.as_ref()).await;
        if let Some(usage) = usage {
            self.state.lock().unwrap().usage.record(usage);
        }
        compilation
    }

    // ───── persistence ───────────────────────────────────────────────

    fn snapshot_locked(state: &State) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            shards: state.store.shards().to_vec(),
            undo_transactions: state.ledger.transactions().to_vec(),
            next_ingest_seq: state.store.next_ingest_seq(),
        }
    }

    /// Current in-memory state as a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Self::snapshot_locked(&self.state.lock().unwrap())
    }

    /// Write the snapshot immediately, bypassing the debounce.
    pub async fn persist_now(&self) {
        let snapshot = self.snapshot();
        self.gateway.save(&snapshot).await;
    }

    /// Write the snapshot if a pending change's debounce window elapsed.
    pub async fn persist_if_due(&self, now: DateTime<Utc>) -> bool {
        if !self.gateway.flush_due(now) {
            return false;
        }
        self.persist_now().await;
        true
    }

    /// When the pending debounced write should happen, if one is pending.
    pub fn next_flush_at(&self) -> Option<DateTime<Utc>> {
        self.gateway.next_flush_at()
    }

    /// Sticky persistence failure state, cleared by the next successful
    /// write.
    pub fn storage_error(&self) -> Option<StorageError> {
        self.gateway.storage_error()
    }
}
