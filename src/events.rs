//! Platform event delivery.
//!
//! Connectivity changes, push deliveries and background wakes reach the
//! engine as explicit subscriptions on an [`EventBus`] rather than ambient
//! global listeners: `subscribe` returns a [`Subscription`] that unregisters
//! its callback when dropped, so the whole control flow stays message-passing
//! between a small set of named channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

/// One event delivered by the host platform.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    ConnectivityChanged { online: bool },
    PushDelivered { data: Vec<u8> },
    /// A named "sync requested" signal (e.g. `sync-invoices`).
    SyncRequested { tag: String },
    /// Periodic wake for lightweight background work.
    PeriodicWake { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectivityChanged,
    PushDelivered,
    SyncRequested,
    PeriodicWake,
}

impl PlatformEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlatformEvent::ConnectivityChanged { .. } => EventKind::ConnectivityChanged,
            PlatformEvent::PushDelivered { .. } => EventKind::PushDelivered,
            PlatformEvent::SyncRequested { .. } => EventKind::SyncRequested,
            PlatformEvent::PeriodicWake { .. } => EventKind::PeriodicWake,
        }
    }
}

type Handler = Arc<dyn Fn(&PlatformEvent) + Send + Sync>;
type Registry = Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>;

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Register a callback for one event kind. The returned subscription
    /// keeps the registration alive; dropping it unsubscribes.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&PlatformEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.registry.lock() {
            Ok(mut registry) => {
                registry
                    .entry(kind)
                    .or_default()
                    .push((id, Arc::new(callback)));
            }
            Err(_) => warn!("event registry poisoned; subscription dropped"),
        }
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every subscriber of its kind. Handlers run outside
    /// the registry lock so they may subscribe or publish themselves.
    pub fn publish(&self, event: &PlatformEvent) {
        let handlers: Vec<Handler> = match self.registry.lock() {
            Ok(registry) => registry
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!("event registry poisoned; event dropped");
                return;
            }
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .map(|r| r.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Handle for one registered callback; dropping it unregisters.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(mut registry) = registry.lock() {
            if let Some(entries) = registry.get_mut(&self.kind) {
                entries.retain(|(id, _)| *id != self.id);
            }
        };
    }
}
