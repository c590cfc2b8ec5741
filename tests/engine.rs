//! Integration tests for the shard store engine.
//!
//! These drive the library API end-to-end: ingestion ordering under
//! concurrency, duplicate rejection, the undo window, selection-scoped
//! compilation, and storage-failure handling. Time-sensitive behavior is
//! driven through explicit `now` values rather than real timers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use collectio::compile::KeywordCurator;
use collectio::config::Config;
use collectio::engine::{Collectio, IngestOutcome};
use collectio::hasher::Sha256Hasher;
use collectio::indexer::{Indexer, KeywordIndexer};
use collectio::models::{Classification, ShardStatus};
use collectio::persist::MemoryKvStore;

// ─── Test doubles ───────────────────────────────────────────────────

/// Delegates to the keyword indexer after a short pause, so concurrent
/// ingests overlap their classification phases.
struct SlowIndexer {
    delay_ms: u64,
}

#[async_trait]
impl Indexer for SlowIndexer {
    fn name(&self) -> &str {
        "slow"
    }

    async fn classify(
        &self,
        content: &str,
        existing_domains: &[String],
    ) -> Result<Classification> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        KeywordIndexer.classify(content, existing_domains).await
    }
}

/// Delegates to the keyword indexer unless failure is switched on.
struct ToggleIndexer {
    fail: AtomicBool,
}

impl ToggleIndexer {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Indexer for ToggleIndexer {
    fn name(&self) -> &str {
        "toggle"
    }

    async fn classify(
        &self,
        content: &str,
        existing_domains: &[String],
    ) -> Result<Classification> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("classifier unavailable");
        }
        KeywordIndexer.classify(content, existing_domains).await
    }
}

fn engine_with(indexer: Arc<dyn Indexer>) -> (Collectio, Arc<MemoryKvStore>) {
    let kv = Arc::new(MemoryKvStore::new());
    let engine = Collectio::new(
        &Config::default(),
        kv.clone(),
        Arc::new(Sha256Hasher),
        indexer,
        Arc::new(KeywordCurator),
    );
    (engine, kv)
}

fn engine() -> Collectio {
    engine_with(Arc::new(KeywordIndexer)).0
}

async fn ingest_id(engine: &Collectio, content: &str) -> String {
    match engine.ingest(content).await.unwrap() {
        IngestOutcome::Ingested(id) => id,
        other => panic!("expected ingestion, got {:?}", other),
    }
}

// ─── Ingestion & deduplication ──────────────────────────────────────

#[tokio::test]
async fn test_empty_input_is_a_noop() {
    let engine = engine();
    assert_eq!(engine.ingest("   \n\t ").await.unwrap(), IngestOutcome::Empty);
    assert!(engine.active_shards().is_empty());
}

#[tokio::test]
async fn test_duplicate_rejected_before_first_classification_completes() {
    let (engine, _) = engine_with(Arc::new(SlowIndexer { delay_ms: 100 }));
    let engine = Arc::new(engine);

    let a = tokio::spawn({
        let engine = engine.clone();
        async move { engine.ingest("The same fragment twice.").await.unwrap() }
    });
    let b = tokio::spawn({
        let engine = engine.clone();
        async move { engine.ingest("The same fragment twice.").await.unwrap() }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    let ingested = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Ingested(_)))
        .count();
    let duplicates = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Duplicate))
        .count();
    assert_eq!(ingested, 1);
    assert_eq!(duplicates, 1);
    assert_eq!(engine.active_shards().len(), 1);
    assert!(engine.duplicate_flag(Utc::now()));
}

#[tokio::test]
async fn test_duplicate_flag_auto_clears() {
    let engine = engine();
    ingest_id(&engine, "once").await;
    assert_eq!(engine.ingest("once").await.unwrap(), IngestOutcome::Duplicate);

    let now = Utc::now();
    assert!(engine.duplicate_flag(now));
    // Default signal window is 4 seconds.
    assert!(!engine.duplicate_flag(now + Duration::seconds(5)));
}

#[tokio::test]
async fn test_whitespace_variants_are_duplicates() {
    let engine = engine();
    ingest_id(&engine, "some content").await;
    assert_eq!(
        engine.ingest("  some content \n").await.unwrap(),
        IngestOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_ingest_seq_matches_call_order_under_concurrency() {
    let (engine, _) = engine_with(Arc::new(SlowIndexer { delay_ms: 30 }));

    // join! polls in argument order, so each call reserves its slot in call
    // order even though classification completes concurrently.
    let (a, b, c, d) = tokio::join!(
        engine.ingest("fragment alpha"),
        engine.ingest("fragment beta"),
        engine.ingest("fragment gamma"),
        engine.ingest("fragment delta"),
    );

    let ids: Vec<String> = [a, b, c, d]
        .into_iter()
        .map(|r| match r.unwrap() {
            IngestOutcome::Ingested(id) => id,
            other => panic!("expected ingestion, got {:?}", other),
        })
        .collect();

    let seqs: Vec<i64> = ids
        .iter()
        .map(|id| engine.shard(id).unwrap().ingest_seq)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_classification_failure_keeps_retryable_shard() {
    let toggle = Arc::new(ToggleIndexer::new());
    let (engine, _) = engine_with(toggle.clone());

    toggle.set_failing(true);
    let id = ingest_id(&engine, "will fail at first").await;
    let shard = engine.shard(&id).unwrap();
    assert_eq!(shard.status, ShardStatus::Error);
    assert!(shard.error.is_some());
    assert!(shard.metadata.is_none());

    toggle.set_failing(false);
    assert!(engine.retry(&id).await.unwrap());
    let shard = engine.shard(&id).unwrap();
    assert_eq!(shard.status, ShardStatus::Ready);
    assert!(shard.metadata.is_some());
    assert!(shard.error.is_none());
}

#[tokio::test]
async fn test_retry_unknown_or_deleted_is_a_noop() {
    let engine = engine();
    assert!(!engine.retry("missing").await.unwrap());

    let id = ingest_id(&engine, "to be deleted").await;
    engine.delete_shard(&id, Utc::now());
    assert!(!engine.retry(&id).await.unwrap());
}

// ─── Undo window ────────────────────────────────────────────────────

#[tokio::test]
async fn test_undo_before_expiry_restores_identical_shard() {
    let engine = engine();
    let id = ingest_id(&engine, "Precious knowledge about Rust and cargo.").await;
    let before = engine.shard(&id).unwrap();

    let t0 = Utc::now();
    assert!(engine.delete_shard(&id, t0));
    assert!(engine.active_shards().is_empty());

    let state = engine.undo_state(t0 + Duration::seconds(2));
    assert!(state.can_undo);
    assert_eq!(state.affected_count, 1);

    assert_eq!(engine.undo_delete(t0 + Duration::seconds(2)), 1);
    let after = engine.shard(&id).unwrap();
    assert!(after.is_active());
    assert_eq!(after.id, before.id);
    assert_eq!(after.content, before.content);
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.metadata, before.metadata);
}

#[tokio::test]
async fn test_undo_after_expiry_is_a_noop_and_shard_is_gone() {
    let engine = engine();
    let id = ingest_id(&engine, "ephemeral").await;

    let t0 = Utc::now();
    engine.delete_shard(&id, t0);

    let later = t0 + Duration::seconds(6);
    assert!(engine.sweep_expired(later) > 0);
    assert!(engine.shard(&id).is_none(), "hard-removed after expiry");
    assert_eq!(engine.undo_delete(later), 0);
}

#[tokio::test]
async fn test_undo_state_closes_at_deadline_without_sweep() {
    let engine = engine();
    let id = ingest_id(&engine, "countdown").await;
    let t0 = Utc::now();
    engine.delete_shard(&id, t0);

    // No sweep has run, but the read model checks real time.
    let state = engine.undo_state(t0 + Duration::seconds(5));
    assert!(!state.can_undo);
    assert_eq!(state.ms_remaining, 0);
}

#[tokio::test]
async fn test_undo_guard_against_reingested_duplicate() {
    let engine = engine();
    let id = ingest_id(&engine, "contested content").await;

    let t0 = Utc::now();
    engine.delete_shard(&id, t0);

    // Identical content re-ingested while the original sits soft-deleted.
    let replacement = ingest_id(&engine, "contested content").await;
    assert_ne!(replacement, id);

    assert_eq!(engine.undo_delete(t0 + Duration::seconds(2)), 0);
    let active = engine.active_shards();
    assert_eq!(active.len(), 1, "exactly one shard with that content");
    assert_eq!(active[0].id, replacement);
    assert!(engine.shard(&id).is_none(), "conflicted shard dropped");
}

#[tokio::test]
async fn test_clear_all_then_undo_restores_original_order() {
    let engine = engine();
    let a = ingest_id(&engine, "first fragment").await;
    let b = ingest_id(&engine, "second fragment").await;
    let c = ingest_id(&engine, "third fragment").await;

    let t0 = Utc::now();
    assert_eq!(engine.clear_all(t0), 3);
    assert!(engine.active_shards().is_empty());

    assert_eq!(engine.undo_delete(t0 + Duration::seconds(1)), 3);
    let order: Vec<String> = engine
        .active_shards()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(order, vec![a, b, c]);
}

#[tokio::test]
async fn test_clear_all_on_empty_store_opens_no_transaction() {
    let engine = engine();
    assert_eq!(engine.clear_all(Utc::now()), 0);
    assert!(engine.next_deadline().is_none());
}

#[tokio::test]
async fn test_undo_targets_latest_transaction_only() {
    let engine = engine();
    let a = ingest_id(&engine, "older delete").await;
    let b = ingest_id(&engine, "newer delete").await;

    let t0 = Utc::now();
    engine.delete_shard(&a, t0);
    engine.delete_shard(&b, t0 + Duration::seconds(1));

    assert_eq!(engine.undo_delete(t0 + Duration::seconds(2)), 1);
    assert!(engine.shard(&b).unwrap().is_active());
    assert!(!engine.shard(&a).unwrap().is_active(), "older stays deleted");

    // The older transaction still expires on its own schedule.
    engine.sweep_expired(t0 + Duration::seconds(10));
    assert!(engine.shard(&a).is_none());
}

#[tokio::test]
async fn test_sweep_reconciles_selection() {
    let engine = engine();
    let id = ingest_id(&engine, "selected then swept").await;
    assert!(engine.toggle_selection(&id));

    let t0 = Utc::now();
    engine.delete_shard(&id, t0);
    assert!(engine.selected_ids().is_empty(), "delete clears selection");

    let keep = ingest_id(&engine, "survivor").await;
    engine.toggle_selection(&keep);
    engine.sweep_expired(t0 + Duration::seconds(6));
    assert_eq!(engine.selected_ids(), vec![keep]);
}

// ─── Selection & compilation ────────────────────────────────────────

#[tokio::test]
async fn test_compile_selection_scoped_in_ingest_order() {
    let engine = engine();
    let x = ingest_id(&engine, "Alpha fragment body.").await;
    let y = ingest_id(&engine, "Beta fragment body.").await;
    let _z = ingest_id(&engine, "Gamma fragment body.").await;

    // Selection insertion order is reversed; compilation order must not be.
    engine.toggle_selection(&y);
    engine.toggle_selection(&x);

    let compilation = engine.compile().await;
    assert_eq!(compilation.shard_count, 2);
    let doc = &compilation.document;
    assert!(doc.contains("Alpha fragment body."));
    assert!(doc.contains("Beta fragment body."));
    assert!(!doc.contains("Gamma fragment body."));
    assert!(
        doc.find("Alpha fragment body.").unwrap() < doc.find("Beta fragment body.").unwrap(),
        "selected shards compile in ingest order"
    );
}

#[tokio::test]
async fn test_compile_without_selection_takes_every_ready_shard() {
    let toggle = Arc::new(ToggleIndexer::new());
    let (engine, _) = engine_with(toggle.clone());

    ingest_id(&engine, "Good one.").await;
    ingest_id(&engine, "Good two.").await;

    toggle.set_failing(true);
    let failed = ingest_id(&engine, "Broken fragment.").await;
    assert_eq!(engine.shard(&failed).unwrap().status, ShardStatus::Error);
    toggle.set_failing(false);

    let doomed = ingest_id(&engine, "Deleted fragment.").await;
    engine.delete_shard(&doomed, Utc::now());

    let compilation = engine.compile().await;
    assert_eq!(compilation.shard_count, 2);
    let doc = &compilation.document;
    assert!(doc.contains("Good one."));
    assert!(doc.contains("Good two."));
    assert!(!doc.contains("Broken fragment."));
    assert!(!doc.contains("Deleted fragment."));
}

#[tokio::test]
async fn test_compile_empty_store_yields_fallback() {
    let engine = engine();
    let compilation = engine.compile().await;
    assert_eq!(compilation.shard_count, 0);
    assert_eq!(compilation.manifest.title, "Empty Collection");
    assert!(compilation.document.is_empty());
}

#[tokio::test]
async fn test_select_all_takes_only_ready_shards() {
    let toggle = Arc::new(ToggleIndexer::new());
    let (engine, _) = engine_with(toggle.clone());

    let good = ingest_id(&engine, "fine").await;
    toggle.set_failing(true);
    let bad = ingest_id(&engine, "broken").await;

    engine.select_all();
    let selected = engine.selected_ids();
    assert_eq!(selected, vec![good]);
    assert!(!selected.contains(&bad));
}

// ─── Persistence failure handling ───────────────────────────────────

#[tokio::test]
async fn test_quota_failure_is_sticky_and_state_survives() {
    let (engine, kv) = engine_with(Arc::new(KeywordIndexer));
    let id = ingest_id(&engine, "must survive the quota failure").await;

    kv.set_quota(Some(4));
    engine.persist_now().await;
    assert_eq!(
        engine.storage_error(),
        Some(collectio::persist::StorageError::QuotaExceeded)
    );
    // In-memory state is untouched by the failed write.
    assert!(engine.shard(&id).is_some());
    assert_eq!(engine.active_shards().len(), 1);

    kv.set_quota(None);
    engine.persist_now().await;
    assert!(engine.storage_error().is_none());
}

#[tokio::test]
async fn test_debounce_coalesces_rapid_mutations() {
    let engine = engine();
    ingest_id(&engine, "one").await;
    ingest_id(&engine, "two").await;

    let now = Utc::now();
    assert!(!engine.persist_if_due(now).await, "window still open");
    assert!(engine.persist_if_due(now + Duration::seconds(1)).await);
    // Nothing pending after the flush.
    assert!(engine.next_flush_at().is_none());
    assert!(!engine.persist_if_due(now + Duration::seconds(2)).await);
}

#[tokio::test]
async fn test_usage_accumulates_across_calls() {
    let engine = engine();
    ingest_id(&engine, "first classified fragment").await;
    ingest_id(&engine, "second classified fragment").await;
    engine.compile().await;

    let usage = engine.usage();
    assert_eq!(usage.calls, 3);
    assert!(usage.input_tokens > 0);
    assert!(usage.output_tokens > 0);
}
