//! Cross-process control channel.
//!
//! A small fixed message vocabulary delivered into the proxy from the
//! application process, serialized as tagged JSON so either side can be
//! replaced independently.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

use super::RequestProxy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Adopt the new proxy version immediately instead of waiting for the
    /// old one to wind down.
    SkipWaiting,
    /// Pre-warm a list of URLs into the dynamic partition.
    CacheUrls { urls: Vec<String> },
    /// Delete every cache partition.
    ClearCache,
    /// Report the summed byte size of all cached responses.
    GetCacheSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
    Ack,
    CacheSize { bytes: u64 },
}

impl RequestProxy {
    /// Handle one control message and produce its reply. Pre-warm fetch
    /// failures are logged and skipped; warming is best effort.
    pub async fn handle_control(&self, message: ControlMessage) -> Result<ControlReply> {
        match message {
            ControlMessage::SkipWaiting => {
                // Version adoption itself is the host's job; the proxy only
                // needs to retire stale partitions.
                info!("skip-waiting requested");
                self.activate()?;
                Ok(ControlReply::Ack)
            }
            ControlMessage::CacheUrls { urls } => {
                let partition = self.cache().dynamic_partition().to_string();
                for url in urls {
                    match self.fetcher.fetch(&url).await {
                        Ok(response) if response.is_success() => {
                            self.cache().put(&partition, &url, &response)?;
                        }
                        Ok(response) => {
                            warn!(%url, status = response.status, "pre-warm skipped")
                        }
                        Err(e) => warn!(%url, "pre-warm fetch failed: {e}"),
                    }
                }
                Ok(ControlReply::Ack)
            }
            ControlMessage::ClearCache => {
                self.cache().clear()?;
                Ok(ControlReply::Ack)
            }
            ControlMessage::GetCacheSize => {
                let bytes = self.cache().total_bytes()?;
                Ok(ControlReply::CacheSize { bytes })
            }
        }
    }
}
