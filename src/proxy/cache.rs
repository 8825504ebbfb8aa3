//! Versioned response cache partitions.
//!
//! Three partitions per deployment, the version tag embedded in each name
//! (`static-v3`, `dynamic-v3`, `api-v3`). Activation deletes every stored
//! partition whose name is not in the current set; that single rule retires
//! all responses cached by previous deployments without a migration step.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::persistence::LocalStore;
use crate::types::CachedResponse;

pub struct ResponseCache {
    store: Arc<dyn LocalStore>,
    static_partition: String,
    dynamic_partition: String,
    api_partition: String,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn LocalStore>, config: &SyncConfig) -> ResponseCache {
        let [static_partition, dynamic_partition, api_partition] = config.cache_partitions();
        ResponseCache {
            store,
            static_partition,
            dynamic_partition,
            api_partition,
        }
    }

    pub fn static_partition(&self) -> &str {
        &self.static_partition
    }

    pub fn dynamic_partition(&self) -> &str {
        &self.dynamic_partition
    }

    pub fn api_partition(&self) -> &str {
        &self.api_partition
    }

    /// Drop every stored partition not in the current set. Returns the names
    /// that were retired.
    pub fn activate(&self) -> Result<Vec<String>> {
        let known = [
            self.static_partition.as_str(),
            self.dynamic_partition.as_str(),
            self.api_partition.as_str(),
        ];
        let mut retired = Vec::new();
        for partition in self.store.cache_partitions()? {
            if !known.contains(&partition.as_str()) {
                info!(%partition, "retiring stale cache partition");
                self.store.cache_drop_partition(&partition)?;
                retired.push(partition);
            }
        }
        Ok(retired)
    }

    pub fn put(&self, partition: &str, url: &str, response: &CachedResponse) -> Result<()> {
        debug!(%partition, %url, bytes = response.byte_len(), "cache store");
        self.store.cache_put(partition, url, response)
    }

    pub fn get(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
        self.store.cache_get(partition, url)
    }

    pub fn clear(&self) -> Result<()> {
        info!("clearing all cache partitions");
        self.store.cache_clear()
    }

    pub fn total_bytes(&self) -> Result<u64> {
        self.store.cache_total_bytes()
    }
}
