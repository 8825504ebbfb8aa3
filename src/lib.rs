pub mod adapter;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod persistence;
pub mod proxy;
pub mod queue;
pub mod remote;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod test_utils;

pub use config::SyncConfig;
pub use coordinator::{DrainOutcome, SyncCoordinator};
pub use error::{Result, SyncError};
pub use types::{EntityKind, MutationAction, SyncState, SyncStatus};
