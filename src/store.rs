//! Canonical shard storage.
//!
//! [`ShardStore`] owns every shard record, including soft-deleted ones
//! awaiting undo expiry, plus the `next_ingest_seq` counter. Sequence slots
//! are reserved synchronously so ingestion order is decided by call order,
//! never by the completion order of asynchronous hashing or classification.

use chrono::{DateTime, Utc};

use crate::models::{Shard, ShardStatus};

/// Bucket label for shards without classification metadata.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// A display grouping of active shards under one domain label.
#[derive(Debug, Clone)]
pub struct DomainGroup {
    pub domain: String,
    pub shards: Vec<Shard>,
}

/// The set of ingested shards and their processing status.
#[derive(Debug, Default)]
pub struct ShardStore {
    shards: Vec<Shard>,
    next_ingest_seq: i64,
}

impl ShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a hydrated snapshot.
    ///
    /// The sequence counter is clamped above every existing shard so ids
    /// from a tampered or stale snapshot can never collide going forward.
    pub fn from_parts(shards: Vec<Shard>, next_ingest_seq: i64) -> Self {
        let max_seq = shards.iter().map(|s| s.ingest_seq).max().unwrap_or(-1);
        Self {
            shards,
            next_ingest_seq: next_ingest_seq.max(max_seq + 1),
        }
    }

    /// Reserve the next ingestion sequence slot.
    pub fn reserve_seq(&mut self) -> i64 {
        let seq = self.next_ingest_seq;
        self.next_ingest_seq += 1;
        seq
    }

    pub fn next_ingest_seq(&self) -> i64 {
        self.next_ingest_seq
    }

    pub fn insert(&mut self, shard: Shard) {
        self.shards.push(shard);
    }

    pub fn get(&self, id: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Shard> {
        self.shards.iter_mut().find(|s| s.id == id)
    }

    /// Permanently remove a shard. Returns the removed record.
    pub fn remove(&mut self, id: &str) -> Option<Shard> {
        let pos = self.shards.iter().position(|s| s.id == id)?;
        Some(self.shards.remove(pos))
    }

    /// Every shard record, soft-deleted included.
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn active(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter().filter(|s| s.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Ids of every active shard, in ingestion order.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<&Shard> = self.active().collect();
        ids.sort_by_key(|s| s.ingest_seq);
        ids.into_iter().map(|s| s.id.clone()).collect()
    }

    /// True when any active shard carries this content hash.
    pub fn has_active_hash(&self, hash: &str) -> bool {
        self.active().any(|s| s.content_hash == hash)
    }

    /// Distinct domain labels among active classified shards, sorted.
    pub fn known_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .active()
            .filter_map(|s| s.domain())
            .map(str::to_string)
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }

    /// Soft-delete a shard under an undo transaction.
    ///
    /// No-op (returns false) when the shard is absent or already deleted.
    pub fn soft_delete(&mut self, id: &str, tx_id: &str, now: DateTime<Utc>) -> bool {
        match self.get_mut(id) {
            Some(shard) if shard.is_active() => {
                shard.deleted_at = Some(now);
                shard.deleted_tx_id = Some(tx_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Reverse a soft delete, clearing both markers.
    pub fn restore(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Some(shard) if !shard.is_active() => {
                shard.deleted_at = None;
                shard.deleted_tx_id = None;
                true
            }
            _ => false,
        }
    }

    /// Active shards grouped for display: domains alphabetical with the
    /// uncategorized bucket last, shards within a domain most recent first.
    pub fn display_groups(&self) -> Vec<DomainGroup> {
        let mut named: Vec<DomainGroup> = Vec::new();
        let mut uncategorized: Vec<Shard> = Vec::new();

        for shard in self.active() {
            match shard.domain() {
                Some(domain) => {
                    match named.iter_mut().find(|g| g.domain == domain) {
                        Some(group) => group.shards.push(shard.clone()),
                        None => named.push(DomainGroup {
                            domain: domain.to_string(),
                            shards: vec![shard.clone()],
                        }),
                    }
                }
                None => uncategorized.push(shard.clone()),
            }
        }

        named.sort_by(|a, b| a.domain.cmp(&b.domain));
        for group in &mut named {
            group.shards.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        if !uncategorized.is_empty() {
            uncategorized.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            named.push(DomainGroup {
                domain: UNCATEGORIZED.to_string(),
                shards: uncategorized,
            });
        }
        named
    }

    /// Active ready shards in compilation order: `ingest_seq` ascending,
    /// tiebreak `timestamp`, then `id` lexically.
    pub fn compilation_order(&self) -> Vec<&Shard> {
        let mut ready: Vec<&Shard> = self
            .shards
            .iter()
            .filter(|s| s.is_active() && s.status == ShardStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            a.ingest_seq
                .cmp(&b.ingest_seq)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShardMetadata;
    use chrono::Duration;

    fn shard(id: &str, seq: i64, hash: &str) -> Shard {
        Shard {
            id: id.to_string(),
            content: format!("content {}", id),
            content_hash: hash.to_string(),
            ingest_seq: seq,
            token_count: 4,
            timestamp: Utc::now(),
            status: ShardStatus::Ready,
            metadata: Some(ShardMetadata {
                title: format!("Shard {}", id),
                domain: "Rust".to_string(),
                synopsis: "s".to_string(),
                tags: vec![],
            }),
            error: None,
            deleted_at: None,
            deleted_tx_id: None,
        }
    }

    #[test]
    fn test_reserve_seq_monotone() {
        let mut store = ShardStore::new();
        assert_eq!(store.reserve_seq(), 0);
        assert_eq!(store.reserve_seq(), 1);
        assert_eq!(store.reserve_seq(), 2);
    }

    #[test]
    fn test_from_parts_clamps_counter() {
        let store = ShardStore::from_parts(vec![shard("a", 7, "h1")], 3);
        assert_eq!(store.next_ingest_seq(), 8);
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let mut store = ShardStore::new();
        store.insert(shard("a", 0, "h1"));
        let now = Utc::now();

        assert!(store.soft_delete("a", "tx1", now));
        assert!(!store.soft_delete("a", "tx2", now), "already deleted");
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.get("a").unwrap().deleted_tx_id.as_deref(), Some("tx1"));

        assert!(store.restore("a"));
        assert!(store.get("a").unwrap().is_active());
        assert!(store.get("a").unwrap().deleted_tx_id.is_none());
        assert!(!store.restore("a"), "already active");
    }

    #[test]
    fn test_has_active_hash_ignores_deleted() {
        let mut store = ShardStore::new();
        store.insert(shard("a", 0, "h1"));
        assert!(store.has_active_hash("h1"));
        store.soft_delete("a", "tx1", Utc::now());
        assert!(!store.has_active_hash("h1"));
    }

    #[test]
    fn test_display_groups_order() {
        let mut store = ShardStore::new();
        let mut zebra = shard("z", 0, "h1");
        zebra.metadata.as_mut().unwrap().domain = "Zebra".to_string();
        let mut apple = shard("a", 1, "h2");
        apple.metadata.as_mut().unwrap().domain = "Apple".to_string();
        let mut pending = shard("p", 2, "h3");
        pending.status = ShardStatus::Pending;
        pending.metadata = None;

        store.insert(zebra);
        store.insert(apple);
        store.insert(pending);

        let groups = store.display_groups();
        let names: Vec<&str> = groups.iter().map(|g| g.domain.as_str()).collect();
        assert_eq!(names, vec!["Apple", "Zebra", UNCATEGORIZED]);
    }

    #[test]
    fn test_display_groups_recent_first_within_domain() {
        let mut store = ShardStore::new();
        let mut older = shard("old", 0, "h1");
        older.timestamp = Utc::now() - Duration::seconds(60);
        let newer = shard("new", 1, "h2");
        store.insert(older);
        store.insert(newer);

        let groups = store.display_groups();
        assert_eq!(groups[0].shards[0].id, "new");
        assert_eq!(groups[0].shards[1].id, "old");
    }

    #[test]
    fn test_compilation_order_ingest_seq_not_timestamp() {
        let mut store = ShardStore::new();
        // Later seq but earlier timestamp must still compile second.
        let mut first = shard("a", 0, "h1");
        first.timestamp = Utc::now();
        let mut second = shard("b", 1, "h2");
        second.timestamp = Utc::now() - Duration::seconds(120);
        store.insert(second.clone());
        store.insert(first);

        let order: Vec<&str> = store
            .compilation_order()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_compilation_order_excludes_unready_and_deleted() {
        let mut store = ShardStore::new();
        store.insert(shard("ready", 0, "h1"));
        let mut erred = shard("err", 1, "h2");
        erred.status = ShardStatus::Error;
        erred.metadata = None;
        store.insert(erred);
        store.insert(shard("gone", 2, "h3"));
        store.soft_delete("gone", "tx", Utc::now());

        let order: Vec<&str> = store
            .compilation_order()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order, vec!["ready"]);
    }

    #[test]
    fn test_known_domains_distinct_sorted() {
        let mut store = ShardStore::new();
        let mut a = shard("a", 0, "h1");
        a.metadata.as_mut().unwrap().domain = "Web".to_string();
        let mut b = shard("b", 1, "h2");
        b.metadata.as_mut().unwrap().domain = "Rust".to_string();
        let mut c = shard("c", 2, "h3");
        c.metadata.as_mut().unwrap().domain = "Web".to_string();
        store.insert(a);
        store.insert(b);
        store.insert(c);

        assert_eq!(store.known_domains(), vec!["Rust", "Web"]);
    }
}
