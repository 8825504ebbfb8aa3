//! Shared fixtures for unit tests: mock implementations of the remote API
//! and fetcher seams, plus store constructors. Public so downstream crates
//! embedding the engine can reuse them in their own tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::persistence::{DuckDbStore, LocalStore, MemoryStore};
use crate::types::OfflineSnapshot;
use crate::proxy::fetch::Fetcher;
use crate::remote::RemoteApi;
use crate::types::{CachedResponse, EntityKind, QueueItem};

pub fn memory_store() -> Arc<dyn LocalStore> {
    Arc::new(MemoryStore::new())
}

/// A DuckDB store backed by a temp directory. Keep the returned directory
/// alive for the duration of the test.
pub fn temp_duckdb_store() -> (Arc<dyn LocalStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DuckDbStore::open(&dir.path().join("test.duckdb")).expect("open store");
    (Arc::new(store), dir)
}

/// In-memory store whose write paths can be made to fail, for exercising
/// infrastructure-failure handling. Reads keep working so the failure is
/// isolated to the operation under test.
#[derive(Default)]
pub struct FaultStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FaultStore {
    pub fn new() -> FaultStore {
        FaultStore::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store("disk full".to_string()));
        }
        Ok(())
    }
}

impl LocalStore for FaultStore {
    fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }

    fn queue_put(&self, item: &QueueItem) -> Result<()> {
        self.check_writable()?;
        self.inner.queue_put(item)
    }

    fn queue_get(&self, id: &str) -> Result<Option<QueueItem>> {
        self.inner.queue_get(id)
    }

    fn queue_delete(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.queue_delete(id)
    }

    fn queue_list(&self) -> Result<Vec<QueueItem>> {
        self.inner.queue_list()
    }

    fn queue_record_failure(&self, id: &str, error: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.queue_record_failure(id, error)
    }

    fn queue_len(&self) -> Result<usize> {
        self.inner.queue_len()
    }

    fn snapshot_save(&self, snapshot: &OfflineSnapshot) -> Result<()> {
        self.check_writable()?;
        self.inner.snapshot_save(snapshot)
    }

    fn snapshot_load(&self) -> Result<Option<OfflineSnapshot>> {
        self.inner.snapshot_load()
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.meta_set(key, value)
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        self.inner.meta_get(key)
    }

    fn cache_put(&self, partition: &str, key: &str, response: &CachedResponse) -> Result<()> {
        self.check_writable()?;
        self.inner.cache_put(partition, key, response)
    }

    fn cache_get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
        self.inner.cache_get(partition, key)
    }

    fn cache_partitions(&self) -> Result<Vec<String>> {
        self.inner.cache_partitions()
    }

    fn cache_drop_partition(&self, partition: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.cache_drop_partition(partition)
    }

    fn cache_clear(&self) -> Result<()> {
        self.check_writable()?;
        self.inner.cache_clear()
    }

    fn cache_total_bytes(&self) -> Result<u64> {
        self.inner.cache_total_bytes()
    }
}

/// Remote API double that records every call and can be told to fail for
/// specific entity ids (HTTP 500) or for everything (network down).
#[derive(Default)]
pub struct MockRemoteApi {
    calls: AtomicUsize,
    failing_ids: Mutex<HashSet<String>>,
    network_down: AtomicBool,
    delay: Mutex<Option<Duration>>,
    unread: AtomicU64,
}

impl MockRemoteApi {
    pub fn new() -> MockRemoteApi {
        MockRemoteApi::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call targeting `entity_id` answer HTTP 500.
    pub fn fail_entity(&self, entity_id: &str) {
        self.failing_ids
            .lock()
            .expect("mock lock")
            .insert(entity_id.to_string());
    }

    pub fn set_network_down(&self, down: bool) {
        self.network_down.store(down, Ordering::SeqCst);
    }

    /// Add an artificial latency to every call (for single-flight tests).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("mock lock") = Some(delay);
    }

    pub fn set_unread(&self, count: u64) {
        self.unread.store(count, Ordering::SeqCst);
    }

    async fn answer(&self, entity_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("mock lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.network_down.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        if self
            .failing_ids
            .lock()
            .expect("mock lock")
            .contains(entity_id)
        {
            return Err(SyncError::RemoteStatus {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn create(&self, _kind: EntityKind, payload: &Value) -> Result<()> {
        let entity_id = QueueItem::entity_id_of(payload).unwrap_or_default();
        self.answer(&entity_id).await
    }

    async fn update(&self, _kind: EntityKind, entity_id: &str, _payload: &Value) -> Result<()> {
        self.answer(entity_id).await
    }

    async fn delete(&self, _kind: EntityKind, entity_id: &str) -> Result<()> {
        self.answer(entity_id).await
    }

    async fn unread_count(&self) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.network_down.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        Ok(self.unread.load(Ordering::SeqCst))
    }
}

/// Fetcher double with a fixed URL → response table and a network switch.
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, CachedResponse>>,
    network_down: AtomicBool,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> MockFetcher {
        MockFetcher::default()
    }

    pub fn insert(&self, url: &str, status: u16, body: &[u8]) {
        self.responses.lock().expect("mock lock").insert(
            url.to_string(),
            CachedResponse::new(status, Some("application/json".to_string()), body.to_vec()),
        );
    }

    pub fn set_network_down(&self, down: bool) {
        self.network_down.store(down, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<CachedResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.network_down.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("network unreachable".to_string()));
        }
        self.responses
            .lock()
            .expect("mock lock")
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::Transport(format!("no route to {url}")))
    }
}
