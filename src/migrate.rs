//! Snapshot format detection and upgrade.
//!
//! Two on-disk formats coexist: the versioned v2 envelope and the legacy
//! bare array of shard records that predates `ingest_seq`, `content_hash`,
//! and soft deletion. Both are decoded here, once, at load time; everything
//! downstream sees only the canonical [`Snapshot`].
//!
//! Legacy upgrade rules:
//! - records are rank-ordered oldest to newest and assigned sequential
//!   `ingest_seq` values from 0, so existing data keeps a stable relative
//!   order;
//! - a missing `content_hash` is backfilled with the tagged weak
//!   fingerprint of the content;
//! - records carrying classification metadata hydrate as `ready`; records
//!   without it hydrate as a retryable `error`.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::hasher::weak_fingerprint;
use crate::models::{
    estimate_tokens, Shard, ShardMetadata, ShardStatus, Snapshot, SNAPSHOT_VERSION,
};

/// Decode a versioned snapshot. Returns `None` unless the version matches
/// and `shards` is list-shaped.
pub fn decode_snapshot(bytes: &[u8]) -> Option<Snapshot> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let version = value.get("version")?.as_u64()? as u32;
    if version != SNAPSHOT_VERSION || !value.get("shards")?.is_array() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// A shard record as older snapshot writers produced it. Every field that
/// arrived later is defaulted.
#[derive(Debug, Deserialize)]
struct LegacyShard {
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    token_count: Option<i64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<ShardMetadata>,
}

/// Upgrade a legacy bare-array snapshot into the canonical form.
pub fn upgrade_legacy(bytes: &[u8]) -> Option<Snapshot> {
    let records: Vec<LegacyShard> = serde_json::from_slice(bytes).ok()?;

    // Rank-order oldest to newest; the sort is stable, so records without a
    // timestamp keep their array order at the front.
    let mut indexed: Vec<(usize, LegacyShard)> = records.into_iter().enumerate().collect();
    indexed.sort_by_key(|(idx, rec)| {
        (rec.timestamp.unwrap_or(DateTime::UNIX_EPOCH), *idx)
    });

    let mut shards = Vec::with_capacity(indexed.len());
    for (seq, (_, rec)) in indexed.into_iter().enumerate() {
        let content_hash = match rec.content_hash {
            Some(hash) if !hash.is_empty() => hash,
            _ => weak_fingerprint(&rec.content),
        };
        let (status, error) = match rec.metadata {
            Some(_) => (ShardStatus::Ready, None),
            None => (
                ShardStatus::Error,
                Some("classification missing after legacy import".to_string()),
            ),
        };
        shards.push(Shard {
            id: rec.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            token_count: rec.token_count.unwrap_or_else(|| estimate_tokens(&rec.content)),
            content_hash,
            ingest_seq: seq as i64,
            timestamp: rec.timestamp.unwrap_or(DateTime::UNIX_EPOCH),
            status,
            metadata: rec.metadata,
            error,
            deleted_at: None,
            deleted_tx_id: None,
            content: rec.content,
        });
    }

    let next_ingest_seq = shards.len() as i64;
    tracing::debug!(shards = shards.len(), "upgraded legacy snapshot");
    Some(Snapshot {
        version: SNAPSHOT_VERSION,
        shards,
        undo_transactions: Vec::new(),
        next_ingest_seq,
    })
}
