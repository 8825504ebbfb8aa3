//! Remote API surface consumed by the sync coordinator and the push bridge.
//!
//! One collection endpoint and one item endpoint per entity kind:
//! `POST /api/{collection}`, `PUT /api/{collection}/{id}`,
//! `DELETE /api/{collection}/{id}`. The trait exists so drains can run
//! against a mock in tests; the production implementation is a thin
//! `reqwest` client with a per-request timeout.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::types::EntityKind;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<()>;
    async fn update(&self, kind: EntityKind, entity_id: &str, payload: &Value) -> Result<()>;
    async fn delete(&self, kind: EntityKind, entity_id: &str) -> Result<()>;
    /// Lightweight poll used by the periodic background wake.
    async fn unread_count(&self) -> Result<u64>;
}

pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteApi {
    pub fn new(config: &SyncConfig) -> Result<HttpRemoteApi> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(HttpRemoteApi {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.base_url, kind.collection_path())
    }

    fn item_url(&self, kind: EntityKind, entity_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind.collection_path(), entity_id)
    }

    async fn check(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(SyncError::RemoteStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<()> {
        let url = self.collection_url(kind);
        debug!(%url, "POST create");
        let response = self.client.post(&url).json(payload).send().await?;
        Self::check(response).await
    }

    async fn update(&self, kind: EntityKind, entity_id: &str, payload: &Value) -> Result<()> {
        let url = self.item_url(kind, entity_id);
        debug!(%url, "PUT update");
        let response = self.client.put(&url).json(payload).send().await?;
        Self::check(response).await
    }

    async fn delete(&self, kind: EntityKind, entity_id: &str) -> Result<()> {
        let url = self.item_url(kind, entity_id);
        debug!(%url, "DELETE");
        let response = self.client.delete(&url).send().await?;
        Self::check(response).await
    }

    async fn unread_count(&self) -> Result<u64> {
        let url = format!("{}/notifications/unread-count", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SyncError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response.json().await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::Decode("unread-count response missing 'count'".to_string()))
    }
}
