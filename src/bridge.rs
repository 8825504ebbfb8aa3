//! Push and background-wake bridge.
//!
//! Connects the platform's out-of-band wake-ups to the engine: push
//! messages become user notifications, named sync signals become queue
//! drains, and the periodic wake refreshes the unread badge count.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::coordinator::SyncCoordinator;
use crate::events::{EventBus, EventKind, PlatformEvent, Subscription};
use crate::persistence::LocalStore;
use crate::remote::RemoteApi;
use crate::types::{NotificationAction, PushPayload};

/// Notification types that must stay on screen until acknowledged.
const URGENT_TYPES: [&str; 3] = ["invoice_overdue", "bill_due", "payment_failed"];

/// Named background-sync signals the bridge responds to. All of them map to
/// a full queue drain; the queue is not partitioned by entity.
const SYNC_TAGS: [&str; 3] = ["sync-transactions", "sync-invoices", "sync-bills"];

/// Metadata key holding the last fetched unread count.
pub const BADGE_COUNT_KEY: &str = "badge_count";

/// A fully resolved notification, ready for the host to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: Option<String>,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
}

/// Decode a push message body: JSON when it parses, otherwise the raw bytes
/// become a plain-text notification body.
pub fn decode_push(data: &[u8]) -> PushPayload {
    match serde_json::from_slice::<PushPayload>(data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("push payload is not JSON ({e}), treating as plain text");
            PushPayload {
                body: Some(String::from_utf8_lossy(data).into_owned()),
                ..PushPayload::default()
            }
        }
    }
}

/// Resolve a decoded payload into a displayable notification. Explicit
/// payload fields win; the notification type (carried in `data.type`) fills
/// in action buttons and flags urgency for the types that warrant it.
pub fn build_notification(payload: &PushPayload) -> Notification {
    let notification_type = payload
        .data
        .as_ref()
        .and_then(|d| d.get("type"))
        .and_then(|t| t.as_str());
    let urgent = notification_type
        .map(|t| URGENT_TYPES.contains(&t))
        .unwrap_or(false);
    let actions = if payload.actions.is_empty() {
        default_actions(notification_type)
    } else {
        payload.actions.clone()
    };
    Notification {
        title: payload
            .title
            .clone()
            .unwrap_or_else(|| "Ledgerbook".to_string()),
        body: payload.body.clone().unwrap_or_default(),
        icon: payload
            .icon
            .clone()
            .unwrap_or_else(|| "/icons/icon-192.png".to_string()),
        badge: payload
            .badge
            .clone()
            .unwrap_or_else(|| "/icons/badge-72.png".to_string()),
        tag: payload.tag.clone(),
        actions,
        require_interaction: payload.require_interaction || urgent,
    }
}

fn default_actions(notification_type: Option<&str>) -> Vec<NotificationAction> {
    let view = |title: &str| NotificationAction {
        action: "view".to_string(),
        title: title.to_string(),
    };
    let dismiss = NotificationAction {
        action: "dismiss".to_string(),
        title: "Dismiss".to_string(),
    };
    match notification_type {
        Some("invoice_overdue") | Some("invoice_paid") => vec![view("View invoice"), dismiss],
        Some("bill_due") => vec![view("View bill"), dismiss],
        Some("payment_failed") => vec![view("View payment"), dismiss],
        _ => vec![NotificationAction {
            action: "open".to_string(),
            title: "Open".to_string(),
        }],
    }
}

type Notifier = Arc<dyn Fn(Notification) + Send + Sync>;

pub struct PushBridge {
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    notifier: Notifier,
}

impl PushBridge {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        notifier: Notifier,
    ) -> PushBridge {
        PushBridge {
            coordinator,
            remote,
            store,
            notifier,
        }
    }

    /// Subscribe the bridge to its three wake-up kinds. Dropping the returned
    /// subscriptions disconnects it. Must be called inside a tokio runtime.
    pub fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
        let push = {
            let notifier = Arc::clone(&self.notifier);
            bus.subscribe(EventKind::PushDelivered, move |event| {
                if let PlatformEvent::PushDelivered { data } = event {
                    let payload = decode_push(data);
                    if payload.silent {
                        debug!("silent push, no notification shown");
                        return;
                    }
                    notifier(build_notification(&payload));
                }
            })
        };
        let sync = {
            let coordinator = Arc::clone(&self.coordinator);
            bus.subscribe(EventKind::SyncRequested, move |event| {
                if let PlatformEvent::SyncRequested { tag } = event {
                    if !SYNC_TAGS.contains(&tag.as_str()) {
                        warn!(%tag, "unknown sync tag ignored");
                        return;
                    }
                    debug!(%tag, "background sync requested");
                    let coordinator = Arc::clone(&coordinator);
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.sync_pending_items().await {
                            error!("background drain failed: {e}");
                        }
                    });
                }
            })
        };
        let wake = {
            let remote = Arc::clone(&self.remote);
            let store = Arc::clone(&self.store);
            bus.subscribe(EventKind::PeriodicWake, move |event| {
                if let PlatformEvent::PeriodicWake { tag } = event {
                    debug!(%tag, "periodic wake");
                    let remote = Arc::clone(&remote);
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        match remote.unread_count().await {
                            Ok(count) => {
                                if let Err(e) =
                                    store.meta_set(BADGE_COUNT_KEY, &count.to_string())
                                {
                                    error!("badge count not persisted: {e}");
                                }
                            }
                            Err(e) => debug!("unread-count poll failed: {e}"),
                        }
                    });
                }
            })
        };
        vec![push, sync, wake]
    }
}
