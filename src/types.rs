//! Core data model shared by the queue, coordinator and application state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of business record collections the engine mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Transaction,
    Invoice,
    Bill,
    Customer,
    Vendor,
    StopOrder,
    Budget,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Transaction,
        EntityKind::Invoice,
        EntityKind::Bill,
        EntityKind::Customer,
        EntityKind::Vendor,
        EntityKind::StopOrder,
        EntityKind::Budget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Transaction => "transaction",
            EntityKind::Invoice => "invoice",
            EntityKind::Bill => "bill",
            EntityKind::Customer => "customer",
            EntityKind::Vendor => "vendor",
            EntityKind::StopOrder => "stop_order",
            EntityKind::Budget => "budget",
        }
    }

    /// REST collection segment on the remote API (`stop_order → stop-orders`).
    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityKind::Transaction => "transactions",
            EntityKind::Invoice => "invoices",
            EntityKind::Bill => "bills",
            EntityKind::Customer => "customers",
            EntityKind::Vendor => "vendors",
            EntityKind::StopOrder => "stop-orders",
            EntityKind::Budget => "budgets",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        EntityKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<MutationAction> {
        match s {
            "create" => Some(MutationAction::Create),
            "update" => Some(MutationAction::Update),
            "delete" => Some(MutationAction::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable mutation intent, the unit the drain loop works through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Derived from `(entity_kind, action, entity_id)` so that re-enqueueing
    /// the same logical operation overwrites rather than duplicates.
    pub id: String,
    pub entity_kind: EntityKind,
    pub action: MutationAction,
    /// Mutated fields for create/update, the identifier for delete.
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Build a queue item for a logical operation. Create payloads without an
    /// `id` field get a generated one injected first, so two offline edits to
    /// the same new record collapse into one create.
    pub fn new(entity_kind: EntityKind, action: MutationAction, mut payload: Value) -> QueueItem {
        if action == MutationAction::Create && Self::entity_id_of(&payload).is_none() {
            if let Value::Object(map) = &mut payload {
                map.insert(
                    "id".to_string(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
        }
        let entity_id = Self::entity_id_of(&payload).unwrap_or_else(|| "unknown".to_string());
        QueueItem {
            id: Self::derive_id(entity_kind, action, &entity_id),
            entity_kind,
            action,
            payload,
            timestamp: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn derive_id(kind: EntityKind, action: MutationAction, entity_id: &str) -> String {
        format!("{}:{}:{}", kind.as_str(), action.as_str(), entity_id)
    }

    /// The target record's identifier: an `id` field for object payloads, the
    /// string itself when the payload is a bare identifier (delete case).
    pub fn entity_id_of(payload: &Value) -> Option<String> {
        match payload {
            Value::Object(map) => map.get("id").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn entity_id(&self) -> Option<String> {
        Self::entity_id_of(&self.payload)
    }
}

/// Last known merged view of remote + local records, persisted wholesale
/// under a single key. The application's in-memory state is a copy of this,
/// never a shared reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineSnapshot {
    pub transactions: Vec<Value>,
    pub invoices: Vec<Value>,
    pub bills: Vec<Value>,
    pub customers: Vec<Value>,
    pub vendors: Vec<Value>,
    pub stop_orders: Vec<Value>,
    pub budgets: Vec<Value>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl OfflineSnapshot {
    pub fn records(&self, kind: EntityKind) -> &Vec<Value> {
        match kind {
            EntityKind::Transaction => &self.transactions,
            EntityKind::Invoice => &self.invoices,
            EntityKind::Bill => &self.bills,
            EntityKind::Customer => &self.customers,
            EntityKind::Vendor => &self.vendors,
            EntityKind::StopOrder => &self.stop_orders,
            EntityKind::Budget => &self.budgets,
        }
    }

    pub fn records_mut(&mut self, kind: EntityKind) -> &mut Vec<Value> {
        match kind {
            EntityKind::Transaction => &mut self.transactions,
            EntityKind::Invoice => &mut self.invoices,
            EntityKind::Bill => &mut self.bills,
            EntityKind::Customer => &mut self.customers,
            EntityKind::Vendor => &mut self.vendors,
            EntityKind::StopOrder => &mut self.stop_orders,
            EntityKind::Budget => &mut self.budgets,
        }
    }
}

/// Coordinator lifecycle state. `Offline` preempts `Syncing`; `Error` is only
/// entered on whole-pass infrastructure failure, never for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Offline,
}

/// In-memory view of the coordinator, mirrored to the UI. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub is_online: bool,
    pub status: SyncStatus,
    pub pending_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            is_online: true,
            status: SyncStatus::Idle,
            pending_count: 0,
            last_sync_time: None,
        }
    }
}

/// Server-origin push payload as delivered over the push channel.
///
/// Every field is optional on the wire; a payload that fails JSON parsing is
/// treated as a plain-text body (see `bridge::decode_push`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub badge: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    #[serde(default)]
    pub require_interaction: bool,
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// One cached response body, keyed by request identity within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Vec<u8>) -> CachedResponse {
        CachedResponse {
            status,
            content_type,
            body,
            stored_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn byte_len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
