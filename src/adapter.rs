//! Offline-aware data operations.
//!
//! Thin wrappers around each entity's create/update/delete that apply the
//! change to in-memory application state immediately and, only while
//! offline, also append it to the mutation queue. While online the direct
//! network call is the primary path and lives outside this crate, so the
//! queue does not grow during normal operation.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::coordinator::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::types::{EntityKind, MutationAction, QueueItem};

pub struct DataOps {
    coordinator: Arc<SyncCoordinator>,
}

impl DataOps {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> DataOps {
        DataOps { coordinator }
    }

    /// Create a record. Payloads without an `id` get one assigned here so
    /// the optimistic copy and the eventually synced record agree.
    pub async fn create(&self, kind: EntityKind, mut payload: Value) -> Result<Option<QueueItem>> {
        if let Value::Object(map) = &mut payload {
            map.entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        }
        self.apply(kind, MutationAction::Create, payload).await
    }

    /// Update a record; the payload must carry the target `id`.
    pub async fn update(&self, kind: EntityKind, payload: Value) -> Result<Option<QueueItem>> {
        if QueueItem::entity_id_of(&payload).is_none() {
            return Err(SyncError::Decode(
                "update payload carries no entity id".to_string(),
            ));
        }
        self.apply(kind, MutationAction::Update, payload).await
    }

    pub async fn delete(&self, kind: EntityKind, entity_id: &str) -> Result<Option<QueueItem>> {
        self.apply(kind, MutationAction::Delete, json!(entity_id))
            .await
    }

    async fn apply(
        &self,
        kind: EntityKind,
        action: MutationAction,
        payload: Value,
    ) -> Result<Option<QueueItem>> {
        {
            let app_state = self.coordinator.app_state();
            let mut state = app_state
                .write()
                .map_err(|_| SyncError::Store("app state lock poisoned".to_string()))?;
            state.apply(kind, action, &payload);
        }
        // Local edits must survive a restart even before any drain runs.
        self.coordinator.publish_snapshot()?;

        if self.coordinator.is_online() {
            debug!(kind = kind.as_str(), "online, direct path owns this write");
            return Ok(None);
        }
        let item = self.coordinator.queue_operation(kind, action, payload).await?;
        Ok(Some(item))
    }
}
