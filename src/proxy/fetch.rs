//! Outbound fetch seam for the request proxy.
//!
//! The proxy never talks to `reqwest` directly; it goes through [`Fetcher`]
//! so strategies can be exercised against a scripted network in tests.

use async_trait::async_trait;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::types::CachedResponse;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` and materialize the response for caching. Non-success
    /// statuses are returned as responses, not errors; only transport
    /// failures error.
    async fn fetch(&self, url: &str) -> Result<CachedResponse>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &SyncConfig) -> Result<HttpFetcher> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<CachedResponse> {
        debug!(%url, "proxy fetch");
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok(CachedResponse::new(status, content_type, body))
    }
}
