//! Error taxonomy for the sync engine.
//!
//! Callers are expected to branch on the variant: transport failures are
//! retryable and end up recorded on queue items, store failures abort the
//! operation that hit them, decode failures degrade to fallbacks.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The local persistent store is unavailable or a read/write failed.
    #[error("local store error: {0}")]
    Store(String),

    /// Network unreachable, connection refused, timeout.
    #[error("network error: {0}")]
    Transport(String),

    /// The remote endpoint answered with a non-success status.
    #[error("remote returned HTTP {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    /// A payload, snapshot or cached body could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Human-readable failure reason recorded on a queue item after a failed
    /// drain attempt. Keeps the HTTP status visible so a UI can show it.
    pub fn drain_reason(&self) -> String {
        match self {
            SyncError::RemoteStatus { status, body } => {
                if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!("HTTP {status}: {body}")
                }
            }
            other => other.to_string(),
        }
    }
}

impl From<duckdb::Error> for SyncError {
    fn from(e: duckdb::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
