//! Engine configuration.
//!
//! Everything tunable lives in [`SyncConfig`]; defaults match the behavior of
//! a small deployment talking to a same-host API. Values can be overridden
//! from a TOML document via [`SyncConfig::from_toml_str`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote API, without a trailing slash.
    pub api_base_url: String,
    /// Own origin; GET requests outside it are only intercepted when their
    /// host is on `allowed_hosts`.
    pub origin: String,
    /// Cross-origin hosts the proxy may still cache (CDN / font hosts).
    pub allowed_hosts: Vec<String>,
    /// Shell resources served cache-first.
    pub static_resources: Vec<String>,
    /// Per-request timeout for remote calls. A hung endpoint must not block a
    /// drain pass indefinitely.
    pub request_timeout_secs: u64,
    /// Periodic background wake interval.
    pub sync_interval_secs: u64,
    /// Failed drain attempts before an item is dead-lettered.
    pub max_retries: u32,
    /// Version tag embedded in cache partition names; bumping it retires all
    /// previously cached responses on activation.
    pub cache_version: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            api_base_url: "http://localhost:8080/api".to_string(),
            origin: "http://localhost:8080".to_string(),
            allowed_hosts: vec![
                "fonts.googleapis.com".to_string(),
                "fonts.gstatic.com".to_string(),
                "cdn.jsdelivr.net".to_string(),
            ],
            static_resources: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/app.css".to_string(),
                "/app.js".to_string(),
            ],
            request_timeout_secs: 30,
            sync_interval_secs: 60,
            max_retries: 5,
            cache_version: 3,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(doc: &str) -> Result<SyncConfig> {
        toml::from_str(doc).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Partition names currently in use, version tag embedded.
    pub fn cache_partitions(&self) -> [String; 3] {
        [
            format!("static-v{}", self.cache_version),
            format!("dynamic-v{}", self.cache_version),
            format!("api-v{}", self.cache_version),
        ]
    }
}
