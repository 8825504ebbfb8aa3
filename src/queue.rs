//! Durable mutation queue.
//!
//! An append-only log of pending create/update/delete intents on top of the
//! local store. Exactly one item exists per logical operation at any time:
//! enqueueing an operation whose derived id is already queued replaces the
//! payload in place instead of adding a duplicate.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::persistence::LocalStore;
use crate::types::{EntityKind, MutationAction, QueueItem};

pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    max_retries: u32,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn LocalStore>, max_retries: u32) -> MutationQueue {
        MutationQueue { store, max_retries }
    }

    /// Append a mutation intent. Idempotent per logical operation: a second
    /// enqueue for the same `(kind, action, entity_id)` overwrites the queued
    /// payload while keeping the item's original timestamp, so it neither
    /// duplicates nor loses its FIFO position. The retry counter is reset —
    /// a fresh edit gets a fresh set of attempts.
    pub fn enqueue(
        &self,
        entity_kind: EntityKind,
        action: MutationAction,
        payload: serde_json::Value,
    ) -> Result<QueueItem> {
        let mut item = QueueItem::new(entity_kind, action, payload);
        if let Some(existing) = self.store.queue_get(&item.id)? {
            item.timestamp = existing.timestamp;
        }
        self.store.queue_put(&item)?;
        debug!(id = %item.id, "queued mutation");
        Ok(item)
    }

    /// Pending items eligible for a drain pass, oldest first. Items that have
    /// exhausted their retries are dead-lettered and excluded here; they stay
    /// in the store for inspection.
    pub fn drain_candidates(&self) -> Result<Vec<QueueItem>> {
        let items = self.store.queue_list()?;
        Ok(items
            .into_iter()
            .filter(|i| i.retry_count < self.max_retries)
            .collect())
    }

    pub fn mark_succeeded(&self, id: &str) -> Result<()> {
        self.store.queue_delete(id)
    }

    /// Record a failed drain attempt: increments `retry_count`, overwrites
    /// `last_error`, leaves the item at its original position.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.store.queue_record_failure(id, error)
    }

    /// Total queued items, dead letters included (they are still pending work
    /// from the user's point of view).
    pub fn count(&self) -> Result<usize> {
        self.store.queue_len()
    }

    /// Full queue contents for UI inspection (`last_error` surfacing is the
    /// UI's job, not this crate's).
    pub fn items(&self) -> Result<Vec<QueueItem>> {
        self.store.queue_list()
    }

    pub fn dead_letters(&self) -> Result<Vec<QueueItem>> {
        let items = self.store.queue_list()?;
        Ok(items
            .into_iter()
            .filter(|i| i.retry_count >= self.max_retries)
            .collect())
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        Ok(self.dead_letters()?.len())
    }
}
