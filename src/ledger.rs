//! Undo transaction ledger.
//!
//! Records reversible batch deletes with a time-boxed validity window.
//! Rather than one timer per transaction, the ledger exposes
//! [`next_deadline`](UndoLedger::next_deadline) (the nearest `expires_at`
//! among open transactions) and [`tick`](UndoLedger::tick); a driver arms a
//! single timer for that deadline, re-arms whenever the transaction set
//! changes, and disarms when no transaction is open. The same pair drives a
//! real timer, a test harness, or a server loop identically.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::{UndoKind, UndoState, UndoStatus, UndoTransaction};

/// Owns every undo transaction record. Shards are referenced by id only.
#[derive(Debug)]
pub struct UndoLedger {
    transactions: Vec<UndoTransaction>,
    ttl: Duration,
}

impl UndoLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            transactions: Vec::new(),
            ttl,
        }
    }

    /// Rebuild a ledger from a hydrated snapshot.
    pub fn from_parts(transactions: Vec<UndoTransaction>, ttl: Duration) -> Self {
        Self { transactions, ttl }
    }

    /// Every transaction record, resolved ones included.
    pub fn transactions(&self) -> &[UndoTransaction] {
        &self.transactions
    }

    /// Open a new transaction covering `shard_ids`. Returns its id.
    pub fn open(
        &mut self,
        kind: UndoKind,
        shard_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.transactions.push(UndoTransaction {
            id: id.clone(),
            kind,
            shard_ids,
            created_at: now,
            expires_at: now + self.ttl,
            status: UndoStatus::Open,
        });
        id
    }

    /// The most recently created transaction that is open and unexpired.
    ///
    /// Undo always targets this one; older open transactions stay pending
    /// expiry but are not individually undoable out of order.
    pub fn latest_open(&self, now: DateTime<Utc>) -> Option<&UndoTransaction> {
        self.transactions
            .iter()
            .rev()
            .find(|tx| tx.status == UndoStatus::Open && tx.expires_at > now)
    }

    /// Mark a transaction as undone. Only valid from `open`.
    pub fn mark_undone(&mut self, id: &str) {
        if let Some(tx) = self
            .transactions
            .iter_mut()
            .find(|tx| tx.id == id && tx.status == UndoStatus::Open)
        {
            tx.status = UndoStatus::Undone;
        }
    }

    /// Expire every open transaction whose deadline has passed.
    ///
    /// Returns the transactions expired by this call so the caller can
    /// hard-remove their shards. Idempotent: transactions already resolved
    /// are never returned again.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<UndoTransaction> {
        let mut expired = Vec::new();
        for tx in &mut self.transactions {
            if tx.status == UndoStatus::Open && tx.expires_at <= now {
                tx.status = UndoStatus::Expired;
                expired.push(tx.clone());
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "undo transactions expired");
        }
        expired
    }

    /// Nearest deadline among open transactions, if any.
    ///
    /// `None` means the driver should disarm its timer entirely.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.transactions
            .iter()
            .filter(|tx| tx.status == UndoStatus::Open)
            .map(|tx| tx.expires_at)
            .min()
    }

    /// Drop resolved transactions that no shard references anymore.
    pub fn prune_resolved(&mut self, referenced: &HashSet<String>) {
        self.transactions
            .retain(|tx| tx.status == UndoStatus::Open || referenced.contains(&tx.id));
    }

    /// Derive the undo affordance read model.
    pub fn undo_state(&self, now: DateTime<Utc>) -> UndoState {
        match self.latest_open(now) {
            Some(tx) => {
                let ms_remaining = (tx.expires_at - now).num_milliseconds().max(0);
                UndoState {
                    can_undo: ms_remaining > 0,
                    kind: Some(tx.kind),
                    affected_count: tx.shard_ids.len(),
                    expires_at: Some(tx.expires_at),
                    ms_remaining,
                }
            }
            None => UndoState::none(),
        }
    }
}
