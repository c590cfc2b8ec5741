//! Core data models for the shard store.
//!
//! These types represent the shards, undo transactions, and compilation
//! outputs that flow through the ingestion and lifecycle engine, plus the
//! versioned snapshot persisted by the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approximate chars-per-token ratio used for the ingestion size estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Processing status of a shard.
///
/// `pending → indexing → ready` on success, `indexing → error` on a
/// classification failure. `error` is recoverable: a retry re-enters
/// `indexing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Pending,
    Indexing,
    Ready,
    Error,
}

/// Classification record produced by the indexer collaborator.
///
/// Present on a shard if and only if its status is [`ShardStatus::Ready`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub title: String,
    pub domain: String,
    #[serde(rename = "abstract")]
    pub synopsis: String,
    pub tags: Vec<String>,
}

/// A unit of ingested knowledge.
///
/// `content` is immutable after creation; `content_hash` is the dedup key,
/// computed asynchronously before the shard is admitted. `ingest_seq` is the
/// stable total order for compilation, independent of wall-clock collisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub ingest_seq: i64,
    pub token_count: i64,
    pub timestamp: DateTime<Utc>,
    pub status: ShardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ShardMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Soft-delete marker. A shard with `deleted_at` unset is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Id of the undo transaction that soft-deleted this shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_tx_id: Option<String>,
}

impl Shard {
    /// True when the shard has not been soft-deleted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// True when the shard is active and fully classified.
    pub fn is_ready(&self) -> bool {
        self.is_active() && self.status == ShardStatus::Ready
    }

    /// Domain label for grouping, or `None` while unclassified.
    pub fn domain(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.domain.as_str())
    }
}

/// Estimate the token cost of a piece of content.
///
/// Uses the same chars-per-token heuristic as the chunking pipeline; cheap,
/// deterministic, and computed exactly once at ingestion.
pub fn estimate_tokens(content: &str) -> i64 {
    (content.chars().count().div_ceil(CHARS_PER_TOKEN)) as i64
}

/// What kind of batch delete an undo transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoKind {
    DeleteOne,
    ClearAll,
}

/// Lifecycle state of an undo transaction.
///
/// `open → undone` (user-triggered, only before expiry) or
/// `open → expired` (time-triggered, irreversible). No transitions out of
/// the resolved states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoStatus {
    Open,
    Undone,
    Expired,
}

/// A reversible batch-delete record.
///
/// `shard_ids` is the exact set of shards soft-deleted by this transaction.
/// Referenced by value: the ledger never holds shard records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoTransaction {
    pub id: String,
    pub kind: UndoKind,
    pub shard_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: UndoStatus,
}

/// Read model for the undo affordance.
///
/// Derived from the single latest open-and-unexpired transaction. `can_undo`
/// checks real time independently of transaction status, so it flips to
/// false the instant the window closes even if no sweep has run yet.
#[derive(Debug, Clone, Serialize)]
pub struct UndoState {
    pub can_undo: bool,
    pub kind: Option<UndoKind>,
    pub affected_count: usize,
    pub expires_at: Option<DateTime<Utc>>,
    pub ms_remaining: i64,
}

impl UndoState {
    pub fn none() -> Self {
        Self {
            can_undo: false,
            kind: None,
            affected_count: 0,
            expires_at: None,
            ms_remaining: 0,
        }
    }
}

/// Provider usage reported by a single collaborator call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Accumulated provider usage for the session. Not persisted.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

impl UsageTotals {
    pub fn record(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.calls += 1;
    }
}

/// Result of classifying one shard's content.
#[derive(Debug, Clone)]
pub struct Classification {
    pub title: String,
    pub domain: String,
    pub synopsis: String,
    pub tags: Vec<String>,
    pub usage: Usage,
}

/// Aggregate shape of a compiled collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    Codebase,
    Document,
    Dataset,
    Mixed,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Codebase => "codebase",
            CollectionType::Document => "document",
            CollectionType::Dataset => "dataset",
            CollectionType::Mixed => "mixed",
        }
    }
}

/// Descriptive manifest for a compiled collection. Derived, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionManifest {
    pub title: String,
    pub collection_type: CollectionType,
    pub description: String,
    pub suggested_filename: String,
}

/// Per-shard summary handed to the manifest collaborator.
#[derive(Debug, Clone)]
pub struct ShardSummary {
    pub id: String,
    pub title: String,
    pub domain: String,
    pub tags: Vec<String>,
    /// First 500 characters of the shard content.
    pub excerpt: String,
}

/// Output of a compilation: the manifest plus the rendered document.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub manifest: CollectionManifest,
    pub document: String,
    pub shard_count: usize,
}

/// Current persisted snapshot version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Versioned snapshot written by the persistence gateway.
///
/// Includes soft-deleted shards and open undo transactions so a reload
/// within the undo window behaves identically to an in-memory session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub shards: Vec<Shard>,
    pub undo_transactions: Vec<UndoTransaction>,
    pub next_ingest_seq: i64,
}
