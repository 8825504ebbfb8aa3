//! Local persistent store.
//!
//! One versioned on-device database holding three logical collections: the
//! offline snapshot (single record under key `"main"`), the mutation queue
//! (keyed by derived id, indexed on timestamp and entity kind) and
//! caller-keyed metadata — plus the interception proxy's response cache,
//! partitioned so eviction never crosses partitions.
//!
//! The [`LocalStore`] trait is the seam: the engine is written against it,
//! the DuckDB implementation is the production backend and the in-memory
//! implementation backs both tests and the degrade-gracefully fallback when
//! the database cannot be opened at startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::types::{CachedResponse, EntityKind, MutationAction, OfflineSnapshot, QueueItem};

/// Snapshot record key. The snapshot is written wholesale under this key.
pub const SNAPSHOT_KEY: &str = "main";

const INSTANCE_ID_KEY: &str = "instance_id";

/// Storage operations the sync engine needs. Each method is one atomic
/// read/write of a named record; the engine relies on that per-record
/// atomicity instead of any higher-level lock.
pub trait LocalStore: Send + Sync {
    /// Stable identifier for this store instance, generated on first open.
    fn instance_id(&self) -> &str;

    // ---- mutation queue ----

    /// Insert or replace a queue item by derived id.
    fn queue_put(&self, item: &QueueItem) -> Result<()>;
    fn queue_get(&self, id: &str) -> Result<Option<QueueItem>>;
    fn queue_delete(&self, id: &str) -> Result<()>;
    /// All pending items, oldest first.
    fn queue_list(&self) -> Result<Vec<QueueItem>>;
    /// Increment `retry_count` and overwrite `last_error` in place.
    fn queue_record_failure(&self, id: &str, error: &str) -> Result<()>;
    fn queue_len(&self) -> Result<usize>;

    // ---- offline snapshot ----

    fn snapshot_save(&self, snapshot: &OfflineSnapshot) -> Result<()>;
    fn snapshot_load(&self) -> Result<Option<OfflineSnapshot>>;

    // ---- metadata ----

    fn meta_set(&self, key: &str, value: &str) -> Result<()>;
    fn meta_get(&self, key: &str) -> Result<Option<String>>;

    // ---- response cache ----

    fn cache_put(&self, partition: &str, key: &str, response: &CachedResponse) -> Result<()>;
    fn cache_get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>>;
    /// Distinct partition names currently holding entries.
    fn cache_partitions(&self) -> Result<Vec<String>>;
    fn cache_drop_partition(&self, partition: &str) -> Result<()>;
    fn cache_clear(&self) -> Result<()>;
    /// Sum of cached body sizes across every partition.
    fn cache_total_bytes(&self) -> Result<u64>;
}

/// Open the DuckDB store at `path`, falling back to an in-memory store when
/// the database cannot be opened. The fallback keeps the application usable
/// with no persistence rather than failing it outright.
pub fn open_or_memory(path: &Path) -> Arc<dyn LocalStore> {
    match DuckDbStore::open(path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("falling back to in-memory store: {e}");
            Arc::new(MemoryStore::new())
        }
    }
}

// ============================================================================
// DuckDB backend
// ============================================================================

#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
    instance_id: String,
}

impl DuckDbStore {
    pub fn open(path: &Path) -> Result<DuckDbStore> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_queue (
                 id TEXT PRIMARY KEY,
                 entity_kind TEXT NOT NULL,
                 action TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 retry_count BIGINT NOT NULL DEFAULT 0,
                 last_error TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue (created_at);
             CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue (entity_kind);
             CREATE TABLE IF NOT EXISTS offline_snapshot (
                 key TEXT PRIMARY KEY,
                 body TEXT NOT NULL,
                 saved_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS metadata (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS response_cache (
                 part TEXT NOT NULL,
                 key TEXT NOT NULL,
                 status BIGINT NOT NULL,
                 content_type TEXT,
                 body BLOB NOT NULL,
                 stored_at TEXT NOT NULL,
                 PRIMARY KEY (part, key)
             );",
        )?;

        let instance_id = Self::load_or_create_instance_id(&conn)?;
        info!(%instance_id, path = %path.display(), "opened local store");
        Ok(DuckDbStore {
            conn: Arc::new(Mutex::new(conn)),
            instance_id,
        })
    }

    fn load_or_create_instance_id(conn: &Connection) -> Result<String> {
        let existing = match conn.query_row(
            "SELECT value FROM metadata WHERE key = ?",
            params![INSTANCE_ID_KEY],
            |row| row.get::<_, String>(0),
        ) {
            Ok(v) => Some(v),
            Err(duckdb::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            params![INSTANCE_ID_KEY, id],
        )?;
        Ok(id)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Store("store mutex poisoned".to_string()))
    }

    fn row_to_item(
        id: String,
        kind: String,
        action: String,
        payload: String,
        created_at: String,
        retry_count: i64,
        last_error: Option<String>,
    ) -> Result<QueueItem> {
        let entity_kind = EntityKind::parse(&kind)
            .ok_or_else(|| SyncError::Decode(format!("unknown entity kind '{kind}'")))?;
        let action = MutationAction::parse(&action)
            .ok_or_else(|| SyncError::Decode(format!("unknown action '{action}'")))?;
        Ok(QueueItem {
            id,
            entity_kind,
            action,
            payload: serde_json::from_str(&payload)?,
            timestamp: parse_rfc3339(&created_at)?,
            retry_count: retry_count as u32,
            last_error,
        })
    }
}

impl LocalStore for DuckDbStore {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn queue_put(&self, item: &QueueItem) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_queue
                 (id, entity_kind, action, payload, created_at, retry_count, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id,
                item.entity_kind.as_str(),
                item.action.as_str(),
                serde_json::to_string(&item.payload)?,
                item.timestamp.to_rfc3339(),
                item.retry_count as i64,
                item.last_error,
            ],
        )?;
        Ok(())
    }

    fn queue_get(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn()?;
        let row = match conn.query_row(
            "SELECT id, entity_kind, action, payload, created_at, retry_count, last_error
             FROM sync_queue WHERE id = ?",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        ) {
            Ok(row) => row,
            Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::row_to_item(row.0, row.1, row.2, row.3, row.4, row.5, row.6).map(Some)
    }

    fn queue_delete(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
        Ok(())
    }

    fn queue_list(&self) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_kind, action, payload, created_at, retry_count, last_error
             FROM sync_queue ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (id, kind, action, payload, created_at, retry_count, last_error) = row?;
            items.push(Self::row_to_item(
                id, kind, action, payload, created_at, retry_count, last_error,
            )?);
        }
        Ok(items)
    }

    fn queue_record_failure(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ? WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }

    fn queue_len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT count(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn snapshot_save(&self, snapshot: &OfflineSnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO offline_snapshot (key, body, saved_at) VALUES (?, ?, ?)",
            params![
                SNAPSHOT_KEY,
                serde_json::to_string(snapshot)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!("snapshot saved");
        Ok(())
    }

    fn snapshot_load(&self) -> Result<Option<OfflineSnapshot>> {
        let conn = self.conn()?;
        let body = match conn.query_row(
            "SELECT body FROM offline_snapshot WHERE key = ?",
            params![SNAPSHOT_KEY],
            |row| row.get::<_, String>(0),
        ) {
            Ok(body) => body,
            Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT value FROM metadata WHERE key = ?",
            params![key],
            |row| row.get::<_, String>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn cache_put(&self, partition: &str, key: &str, response: &CachedResponse) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO response_cache
                 (part, key, status, content_type, body, stored_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                partition,
                key,
                response.status as i64,
                response.content_type,
                response.body,
                response.stored_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn cache_get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
        let conn = self.conn()?;
        let row = match conn.query_row(
            "SELECT status, content_type, body, stored_at
             FROM response_cache WHERE part = ? AND key = ?",
            params![partition, key],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        ) {
            Ok(row) => row,
            Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CachedResponse {
            status: row.0 as u16,
            content_type: row.1,
            body: row.2,
            stored_at: parse_rfc3339(&row.3)?,
        }))
    }

    fn cache_partitions(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT part FROM response_cache ORDER BY part")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut partitions = Vec::new();
        for row in rows {
            partitions.push(row?);
        }
        Ok(partitions)
    }

    fn cache_drop_partition(&self, partition: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM response_cache WHERE part = ?", params![partition])?;
        Ok(())
    }

    fn cache_clear(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM response_cache", [])?;
        Ok(())
    }

    fn cache_total_bytes(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT coalesce(sum(octet_length(body)), 0) FROM response_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    queue: HashMap<String, QueueItem>,
    snapshot: Option<OfflineSnapshot>,
    metadata: HashMap<String, String>,
    cache: HashMap<(String, String), CachedResponse>,
}

/// Non-durable store used for tests and the startup fallback. Nothing
/// survives a restart; the queueing API keeps working so the application
/// does not have to special-case the degraded mode.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    instance_id: String,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: Mutex::new(MemoryInner::default()),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn inner(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Store("store mutex poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn queue_put(&self, item: &QueueItem) -> Result<()> {
        self.inner()?.queue.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn queue_get(&self, id: &str) -> Result<Option<QueueItem>> {
        Ok(self.inner()?.queue.get(id).cloned())
    }

    fn queue_delete(&self, id: &str) -> Result<()> {
        self.inner()?.queue.remove(id);
        Ok(())
    }

    fn queue_list(&self) -> Result<Vec<QueueItem>> {
        let inner = self.inner()?;
        let mut items: Vec<QueueItem> = inner.queue.values().cloned().collect();
        items.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(items)
    }

    fn queue_record_failure(&self, id: &str, error: &str) -> Result<()> {
        if let Some(item) = self.inner()?.queue.get_mut(id) {
            item.retry_count += 1;
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }

    fn queue_len(&self) -> Result<usize> {
        Ok(self.inner()?.queue.len())
    }

    fn snapshot_save(&self, snapshot: &OfflineSnapshot) -> Result<()> {
        self.inner()?.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn snapshot_load(&self) -> Result<Option<OfflineSnapshot>> {
        Ok(self.inner()?.snapshot.clone())
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner()?
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner()?.metadata.get(key).cloned())
    }

    fn cache_put(&self, partition: &str, key: &str, response: &CachedResponse) -> Result<()> {
        self.inner()?
            .cache
            .insert((partition.to_string(), key.to_string()), response.clone());
        Ok(())
    }

    fn cache_get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
        Ok(self
            .inner()?
            .cache
            .get(&(partition.to_string(), key.to_string()))
            .cloned())
    }

    fn cache_partitions(&self) -> Result<Vec<String>> {
        let inner = self.inner()?;
        let mut partitions: Vec<String> = inner.cache.keys().map(|(p, _)| p.clone()).collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    fn cache_drop_partition(&self, partition: &str) -> Result<()> {
        self.inner()?.cache.retain(|(p, _), _| p != partition);
        Ok(())
    }

    fn cache_clear(&self) -> Result<()> {
        self.inner()?.cache.clear();
        Ok(())
    }

    fn cache_total_bytes(&self) -> Result<u64> {
        Ok(self.inner()?.cache.values().map(|r| r.byte_len()).sum())
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SyncError::Decode(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, MutationAction};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_item(entity_id: &str) -> QueueItem {
        QueueItem::new(
            EntityKind::Invoice,
            MutationAction::Create,
            json!({"id": entity_id, "total": 100}),
        )
    }

    #[test]
    fn duckdb_queue_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DuckDbStore::open(&dir.path().join("books.duckdb")).unwrap();

        let item = sample_item("inv_1");
        store.queue_put(&item).unwrap();
        assert_eq!(store.queue_len().unwrap(), 1);

        let loaded = store.queue_get(&item.id).unwrap().expect("item present");
        assert_eq!(loaded.payload, item.payload);
        assert_eq!(loaded.retry_count, 0);

        store.queue_record_failure(&item.id, "HTTP 500").unwrap();
        let failed = store.queue_get(&item.id).unwrap().unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 500"));

        store.queue_delete(&item.id).unwrap();
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[test]
    fn duckdb_queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("books.duckdb");

        let before: Vec<QueueItem>;
        {
            let store = DuckDbStore::open(&path).unwrap();
            store.queue_put(&sample_item("inv_1")).unwrap();
            store.queue_put(&sample_item("inv_2")).unwrap();
            before = store.queue_list().unwrap();
        }

        let store = DuckDbStore::open(&path).unwrap();
        let after = store.queue_list().unwrap();
        assert_eq!(after.len(), before.len());
        for (a, b) in after.iter().zip(before.iter()) {
            assert_eq!(a.id, b.id);
            // Byte-identical payloads across restart.
            assert_eq!(
                serde_json::to_vec(&a.payload).unwrap(),
                serde_json::to_vec(&b.payload).unwrap()
            );
        }
    }

    #[test]
    fn duckdb_instance_id_is_stable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("books.duckdb");
        let first = DuckDbStore::open(&path).unwrap().instance_id().to_string();
        let second = DuckDbStore::open(&path).unwrap().instance_id().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn duckdb_snapshot_and_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DuckDbStore::open(&dir.path().join("books.duckdb")).unwrap();

        assert!(store.snapshot_load().unwrap().is_none());
        let mut snapshot = OfflineSnapshot::default();
        snapshot.invoices.push(json!({"id": "inv_1", "total": 100}));
        snapshot.last_sync_at = Some(Utc::now());
        store.snapshot_save(&snapshot).unwrap();

        let loaded = store.snapshot_load().unwrap().unwrap();
        assert_eq!(loaded.invoices, snapshot.invoices);

        store.meta_set("badge_count", "4").unwrap();
        assert_eq!(store.meta_get("badge_count").unwrap().as_deref(), Some("4"));
        assert!(store.meta_get("missing").unwrap().is_none());
    }

    #[test]
    fn duckdb_cache_partitions_and_size() {
        let dir = tempdir().unwrap();
        let store = DuckDbStore::open(&dir.path().join("books.duckdb")).unwrap();

        let resp = CachedResponse::new(200, Some("text/html".into()), b"<html/>".to_vec());
        store.cache_put("static-v3", "GET /index.html", &resp).unwrap();
        store
            .cache_put("api-v3", "GET /api/invoices", &CachedResponse::new(200, None, b"[]".to_vec()))
            .unwrap();

        assert_eq!(
            store.cache_partitions().unwrap(),
            vec!["api-v3".to_string(), "static-v3".to_string()]
        );
        assert_eq!(store.cache_total_bytes().unwrap(), 7 + 2);

        let hit = store.cache_get("static-v3", "GET /index.html").unwrap().unwrap();
        assert_eq!(hit.body, resp.body);

        store.cache_drop_partition("static-v3").unwrap();
        assert!(store.cache_get("static-v3", "GET /index.html").unwrap().is_none());
        assert_eq!(store.cache_partitions().unwrap(), vec!["api-v3".to_string()]);

        store.cache_clear().unwrap();
        assert_eq!(store.cache_total_bytes().unwrap(), 0);
    }

    #[test]
    fn memory_store_queue_is_fifo() {
        let store = MemoryStore::new();
        let first = sample_item("inv_1");
        let mut second = sample_item("inv_2");
        second.timestamp = first.timestamp + chrono::Duration::seconds(1);
        store.queue_put(&second).unwrap();
        store.queue_put(&first).unwrap();

        let listed = store.queue_list().unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[test]
    fn open_or_memory_falls_back_on_bad_path() {
        // A directory path is not a valid database file.
        let dir = tempdir().unwrap();
        let store = open_or_memory(dir.path());
        // Degraded store still accepts writes.
        store.queue_put(&sample_item("inv_1")).unwrap();
        assert_eq!(store.queue_len().unwrap(), 1);
    }
}
