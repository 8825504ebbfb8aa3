//! Sync coordination.
//!
//! The coordinator owns the drain loop: it walks the mutation queue oldest
//! first, replays each intent against the remote API, and reconciles the
//! persisted snapshot back into application state when the pass finishes.
//! A compare-and-swap flag keeps at most one drain in flight per process;
//! triggers that arrive mid-drain coalesce into a no-op, which is safe
//! because every pass re-reads the queue from the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventKind, PlatformEvent, Subscription};
use crate::persistence::LocalStore;
use crate::queue::MutationQueue;
use crate::remote::RemoteApi;
use crate::state::SharedAppState;
use crate::types::{EntityKind, MutationAction, QueueItem, SyncState, SyncStatus};

/// Result of one drain trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A pass ran to completion (individual items may still have failed).
    Completed(DrainSummary),
    /// Another drain already held the flag; this trigger coalesced into it.
    AlreadyRunning,
    /// The engine is offline; nothing was attempted.
    Offline,
    /// No eligible items were queued.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteApi>,
    app_state: SharedAppState,
    sync_state: Arc<RwLock<SyncState>>,
    draining: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the pass ends, on the error path too.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        app_state: SharedAppState,
    ) -> SyncCoordinator {
        let queue = Arc::new(MutationQueue::new(Arc::clone(&store), config.max_retries));
        SyncCoordinator {
            config,
            store,
            queue,
            remote,
            app_state,
            sync_state: Arc::new(RwLock::new(SyncState::default())),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn app_state(&self) -> SharedAppState {
        Arc::clone(&self.app_state)
    }

    /// Current status snapshot for UI consumption.
    pub fn sync_state(&self) -> SyncState {
        self.sync_state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.sync_state().is_online
    }

    fn update_state(&self, mutate: impl FnOnce(&mut SyncState)) {
        match self.sync_state.write() {
            Ok(mut state) => mutate(&mut state),
            Err(_) => warn!("sync state lock poisoned; update dropped"),
        }
    }

    /// Load the persisted snapshot into application state and seed the
    /// pending counter, then attempt an initial drain. Call once at process
    /// start, before any UI reads.
    pub async fn startup(&self) -> Result<()> {
        self.reload_app_state()?;
        let pending = self.queue.count()?;
        self.update_state(|state| state.pending_count = pending);
        info!(pending, "sync coordinator started");
        if pending > 0 {
            let _ = self.sync_pending_items().await?;
        }
        Ok(())
    }

    /// Record a connectivity transition. Going offline flips the status to
    /// [`SyncStatus::Offline`] immediately; coming back online kicks off a
    /// drain of whatever accumulated while disconnected.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.is_online();
        self.update_state(|state| {
            state.is_online = online;
            if !online {
                state.status = SyncStatus::Offline;
            } else if state.status == SyncStatus::Offline {
                state.status = SyncStatus::Idle;
            }
        });
        if online && !was_online {
            info!("connectivity restored, draining queue");
            if let Err(e) = self.sync_pending_items().await {
                error!("reconnect drain failed: {e}");
            }
        } else if !online {
            debug!("connectivity lost");
        }
    }

    /// Persist one mutation intent and, when online, immediately try to
    /// drain it. The item survives in the queue either way until the remote
    /// acknowledges it.
    pub async fn queue_operation(
        &self,
        kind: EntityKind,
        action: MutationAction,
        payload: serde_json::Value,
    ) -> Result<QueueItem> {
        let item = self.queue.enqueue(kind, action, payload)?;
        let pending = self.queue.count()?;
        self.update_state(|state| state.pending_count = pending);
        if self.is_online() {
            // Best effort; a failed pass leaves the item queued for later.
            let _ = self.sync_pending_items().await;
        }
        Ok(item)
    }

    /// Drain the queue against the remote, oldest first. At most one pass
    /// runs at a time; concurrent triggers return
    /// [`DrainOutcome::AlreadyRunning`]. A failing item is recorded and
    /// skipped so the rest of the queue still drains.
    pub async fn sync_pending_items(&self) -> Result<DrainOutcome> {
        if !self.is_online() {
            return Ok(DrainOutcome::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in flight, coalescing");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(Arc::clone(&self.draining));

        let candidates = self.queue.drain_candidates()?;
        if candidates.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        self.update_state(|state| state.status = SyncStatus::Syncing);
        info!(count = candidates.len(), "draining pending mutations");

        match self.drain(candidates).await {
            Ok(summary) => {
                info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "drain pass finished"
                );
                Ok(DrainOutcome::Completed(summary))
            }
            Err(e) => {
                error!("drain pass aborted: {e}");
                self.update_state(|state| state.status = SyncStatus::Error);
                Err(e)
            }
        }
    }

    async fn drain(&self, items: Vec<QueueItem>) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        for item in items {
            summary.attempted += 1;
            match self.send_item(&item).await {
                Ok(()) => {
                    self.queue.mark_succeeded(&item.id)?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    warn!(id = %item.id, "mutation rejected: {e}");
                    self.queue.mark_failed(&item.id, &e.drain_reason())?;
                    summary.failed += 1;
                }
            }
        }

        let now = Utc::now();
        let mut snapshot = self.store.snapshot_load()?.unwrap_or_default();
        snapshot.last_sync_at = Some(now);
        self.store.snapshot_save(&snapshot)?;
        self.reload_app_state()?;

        let pending = self.queue.count()?;
        self.update_state(|state| {
            state.pending_count = pending;
            state.last_sync_time = Some(now);
            state.status = if state.is_online {
                SyncStatus::Idle
            } else {
                SyncStatus::Offline
            };
        });
        Ok(summary)
    }

    async fn send_item(&self, item: &QueueItem) -> Result<()> {
        match item.action {
            MutationAction::Create => self.remote.create(item.entity_kind, &item.payload).await,
            MutationAction::Update => {
                let entity_id = Self::require_entity_id(item)?;
                self.remote
                    .update(item.entity_kind, &entity_id, &item.payload)
                    .await
            }
            MutationAction::Delete => {
                let entity_id = Self::require_entity_id(item)?;
                self.remote.delete(item.entity_kind, &entity_id).await
            }
        }
    }

    fn require_entity_id(item: &QueueItem) -> Result<String> {
        QueueItem::entity_id_of(&item.payload).ok_or_else(|| {
            SyncError::Decode(format!("queued item {} has no entity id", item.id))
        })
    }

    /// Write the current application state back to the persisted snapshot.
    /// The offline-aware layer calls this after each optimistic apply so
    /// local edits survive a restart.
    pub fn publish_snapshot(&self) -> Result<()> {
        let snapshot = self
            .app_state
            .read()
            .map_err(|_| SyncError::Store("app state lock poisoned".to_string()))?
            .to_snapshot();
        self.store.snapshot_save(&snapshot)
    }

    fn reload_app_state(&self) -> Result<()> {
        if let Some(snapshot) = self.store.snapshot_load()? {
            let mut state = self
                .app_state
                .write()
                .map_err(|_| SyncError::Store("app state lock poisoned".to_string()))?;
            state.replace_from(snapshot);
        }
        Ok(())
    }

    /// Wire connectivity transitions from a platform event bus into
    /// [`SyncCoordinator::set_online`]. The returned subscription must be
    /// kept alive; dropping it disconnects the coordinator from the bus.
    /// Must be called from within a tokio runtime.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let coordinator = Arc::clone(self);
        bus.subscribe(EventKind::ConnectivityChanged, move |event| {
            if let PlatformEvent::ConnectivityChanged { online } = *event {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator.set_online(online).await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use crate::test_utils::{memory_store, FaultStore, MockRemoteApi};
    use crate::types::OfflineSnapshot;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator_with(remote: Arc<MockRemoteApi>) -> SyncCoordinator {
        SyncCoordinator::new(
            SyncConfig::default(),
            memory_store(),
            remote,
            AppState::shared(OfflineSnapshot::default()),
        )
    }

    #[tokio::test]
    async fn offline_invoice_drains_on_reconnect() {
        let remote = Arc::new(MockRemoteApi::new());
        let coordinator = coordinator_with(Arc::clone(&remote));

        coordinator.set_online(false).await;
        coordinator
            .queue_operation(
                EntityKind::Invoice,
                MutationAction::Create,
                json!({"id": "inv_1", "total": 420}),
            )
            .await
            .unwrap();

        // Nothing reaches the remote while offline.
        assert_eq!(remote.call_count(), 0);
        assert_eq!(coordinator.sync_state().status, SyncStatus::Offline);
        assert_eq!(coordinator.sync_state().pending_count, 1);

        coordinator.set_online(true).await;
        assert_eq!(remote.call_count(), 1);
        let state = coordinator.sync_state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.pending_count, 0);
        assert!(state.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn server_rejection_keeps_item_queued_with_reason() {
        let remote = Arc::new(MockRemoteApi::new());
        remote.fail_entity("inv_1");
        let coordinator = coordinator_with(Arc::clone(&remote));

        coordinator
            .queue_operation(
                EntityKind::Invoice,
                MutationAction::Create,
                json!({"id": "inv_1", "total": 420}),
            )
            .await
            .unwrap();

        let items = coordinator.queue().items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 1);
        let reason = items[0].last_error.as_deref().unwrap();
        assert!(reason.contains("500"), "reason was: {reason}");
        // One bad item does not put the coordinator in the error state.
        assert_eq!(coordinator.sync_state().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn failing_item_does_not_block_the_rest() {
        let remote = Arc::new(MockRemoteApi::new());
        remote.fail_entity("bill_bad");
        let coordinator = coordinator_with(Arc::clone(&remote));
        coordinator.set_online(false).await;

        for id in ["bill_ok_1", "bill_bad", "bill_ok_2"] {
            coordinator
                .queue_operation(EntityKind::Bill, MutationAction::Create, json!({"id": id}))
                .await
                .unwrap();
        }
        coordinator.set_online(true).await;

        let remaining = coordinator.queue().items().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "bill:create:bill_bad");
        assert_eq!(coordinator.sync_state().pending_count, 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_run_one_pass() {
        let remote = Arc::new(MockRemoteApi::new());
        remote.set_delay(Duration::from_millis(50));
        let coordinator = coordinator_with(Arc::clone(&remote));
        coordinator.set_online(false).await;
        coordinator
            .queue_operation(
                EntityKind::Transaction,
                MutationAction::Create,
                json!({"id": "tx_1"}),
            )
            .await
            .unwrap();
        // Flip back online without triggering set_online's own drain.
        coordinator.update_state(|state| {
            state.is_online = true;
            state.status = SyncStatus::Idle;
        });

        let first = coordinator.clone();
        let second = coordinator.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.sync_pending_items().await.unwrap() }),
            tokio::spawn(async move { second.sync_pending_items().await.unwrap() }),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(remote.call_count(), 1);
        assert!(outcomes.contains(&DrainOutcome::AlreadyRunning));
        assert!(outcomes.iter().any(|o| matches!(
            o,
            DrainOutcome::Completed(DrainSummary {
                succeeded: 1,
                failed: 0,
                ..
            })
        )));
    }

    #[tokio::test]
    async fn network_failure_retries_on_next_pass() {
        let remote = Arc::new(MockRemoteApi::new());
        remote.set_network_down(true);
        let coordinator = coordinator_with(Arc::clone(&remote));

        coordinator
            .queue_operation(
                EntityKind::StopOrder,
                MutationAction::Delete,
                json!("so_1"),
            )
            .await
            .unwrap();
        assert_eq!(coordinator.queue().count().unwrap(), 1);

        remote.set_network_down(false);
        let outcome = coordinator.sync_pending_items().await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Completed(_)));
        assert_eq!(coordinator.queue().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn startup_loads_snapshot_into_app_state() {
        let remote = Arc::new(MockRemoteApi::new());
        let store = memory_store();
        let mut snapshot = OfflineSnapshot::default();
        snapshot.invoices.push(json!({"id": "inv_persisted"}));
        store.snapshot_save(&snapshot).unwrap();

        let coordinator = SyncCoordinator::new(
            SyncConfig::default(),
            store,
            remote,
            AppState::shared(OfflineSnapshot::default()),
        );
        coordinator.startup().await.unwrap();

        let app_state = coordinator.app_state();
        let state = app_state.read().unwrap();
        assert_eq!(state.records(EntityKind::Invoice).len(), 1);
    }

    #[tokio::test]
    async fn store_failure_enters_error_state_and_releases_the_flag() {
        let remote = Arc::new(MockRemoteApi::new());
        let store = Arc::new(FaultStore::new());
        let coordinator = SyncCoordinator::new(
            SyncConfig::default(),
            Arc::clone(&store) as Arc<dyn crate::persistence::LocalStore>,
            Arc::clone(&remote) as Arc<dyn crate::remote::RemoteApi>,
            AppState::shared(OfflineSnapshot::default()),
        );
        coordinator
            .queue()
            .enqueue(
                EntityKind::Invoice,
                MutationAction::Create,
                json!({"id": "inv_1"}),
            )
            .unwrap();

        // The remote accepts the item but removing it from the queue fails.
        store.set_fail_writes(true);
        let err = coordinator.sync_pending_items().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(coordinator.sync_state().status, SyncStatus::Error);

        // The in-flight flag was released, so a later trigger still runs and
        // recovers once the store is healthy again.
        store.set_fail_writes(false);
        let outcome = coordinator.sync_pending_items().await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Completed(_)));
        assert_eq!(coordinator.sync_state().status, SyncStatus::Idle);
        assert_eq!(coordinator.queue().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn attach_drains_on_connectivity_event() {
        let remote = Arc::new(MockRemoteApi::new());
        let coordinator = Arc::new(coordinator_with(Arc::clone(&remote)));
        coordinator.set_online(false).await;
        coordinator
            .queue_operation(
                EntityKind::Customer,
                MutationAction::Create,
                json!({"id": "c_1"}),
            )
            .await
            .unwrap();

        let bus = EventBus::new();
        let _sub = coordinator.attach(&bus);
        bus.publish(&PlatformEvent::ConnectivityChanged { online: true });

        // The handler spawns a task; give it a moment to run.
        for _ in 0..50 {
            if coordinator.queue().count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.call_count(), 1);
        assert_eq!(coordinator.queue().count().unwrap(), 0);
    }
}
