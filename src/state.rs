//! In-memory application state.
//!
//! An explicit copy of the persisted snapshot, taken at initialization and
//! refreshed only through [`AppState::replace_from`] after a drain. The
//! snapshot record and this state are never the same object; synchronization
//! happens via explicit save/load calls, not shared mutable reference.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{EntityKind, MutationAction, OfflineSnapshot, QueueItem};

pub type SharedAppState = Arc<RwLock<AppState>>;

#[derive(Debug, Default)]
pub struct AppState {
    data: OfflineSnapshot,
}

impl AppState {
    pub fn from_snapshot(snapshot: OfflineSnapshot) -> AppState {
        AppState { data: snapshot }
    }

    pub fn shared(snapshot: OfflineSnapshot) -> SharedAppState {
        Arc::new(RwLock::new(AppState::from_snapshot(snapshot)))
    }

    /// Replace the whole state with a freshly loaded snapshot.
    pub fn replace_from(&mut self, snapshot: OfflineSnapshot) {
        self.data = snapshot;
    }

    /// Copy of the current state in snapshot form, for persisting.
    pub fn to_snapshot(&self) -> OfflineSnapshot {
        self.data.clone()
    }

    pub fn records(&self, kind: EntityKind) -> &[Value] {
        self.data.records(kind)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.data.last_sync_at
    }

    /// Apply one mutation optimistically. Create inserts (or replaces a
    /// record that already carries the same id), update shallow-merges the
    /// mutated fields into the matching record, delete removes it. Unknown
    /// targets are a no-op for update/delete; the remote stays authoritative.
    pub fn apply(&mut self, kind: EntityKind, action: MutationAction, payload: &Value) {
        let records = self.data.records_mut(kind);
        match action {
            MutationAction::Create => {
                if let Some(id) = QueueItem::entity_id_of(payload) {
                    records.retain(|r| QueueItem::entity_id_of(r).as_deref() != Some(id.as_str()));
                }
                records.push(payload.clone());
            }
            MutationAction::Update => {
                let Some(id) = QueueItem::entity_id_of(payload) else {
                    return;
                };
                if let Some(existing) = records
                    .iter_mut()
                    .find(|r| QueueItem::entity_id_of(r).as_deref() == Some(id.as_str()))
                {
                    merge_fields(existing, payload);
                }
            }
            MutationAction::Delete => {
                let Some(id) = QueueItem::entity_id_of(payload) else {
                    return;
                };
                records.retain(|r| QueueItem::entity_id_of(r).as_deref() != Some(id.as_str()));
            }
        }
    }
}

/// Shallow field merge: every key in `incoming` overwrites the same key in
/// `target`. Non-object payloads replace the record wholesale.
fn merge_fields(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
        (target, incoming) => *target = incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_then_update_then_delete() {
        let mut state = AppState::default();
        state.apply(
            EntityKind::Invoice,
            MutationAction::Create,
            &json!({"id": "inv_1", "total": 100, "customer": "Acme"}),
        );
        assert_eq!(state.records(EntityKind::Invoice).len(), 1);

        state.apply(
            EntityKind::Invoice,
            MutationAction::Update,
            &json!({"id": "inv_1", "total": 250}),
        );
        let record = &state.records(EntityKind::Invoice)[0];
        assert_eq!(record["total"], 250);
        // Fields not named by the update survive.
        assert_eq!(record["customer"], "Acme");

        state.apply(EntityKind::Invoice, MutationAction::Delete, &json!("inv_1"));
        assert!(state.records(EntityKind::Invoice).is_empty());
    }

    #[test]
    fn create_with_same_id_replaces() {
        let mut state = AppState::default();
        state.apply(
            EntityKind::Customer,
            MutationAction::Create,
            &json!({"id": "c_1", "name": "Old"}),
        );
        state.apply(
            EntityKind::Customer,
            MutationAction::Create,
            &json!({"id": "c_1", "name": "New"}),
        );
        let records = state.records(EntityKind::Customer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "New");
    }

    #[test]
    fn update_of_unknown_record_is_a_noop() {
        let mut state = AppState::default();
        state.apply(
            EntityKind::Budget,
            MutationAction::Update,
            &json!({"id": "b_404", "amount": 7}),
        );
        assert!(state.records(EntityKind::Budget).is_empty());
    }

    #[test]
    fn replace_from_swaps_the_whole_view() {
        let mut state = AppState::default();
        state.apply(
            EntityKind::Bill,
            MutationAction::Create,
            &json!({"id": "bill_1"}),
        );

        let mut snapshot = OfflineSnapshot::default();
        snapshot.bills.push(json!({"id": "bill_2"}));
        state.replace_from(snapshot);

        let bills = state.records(EntityKind::Bill);
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0]["id"], "bill_2");
    }
}
