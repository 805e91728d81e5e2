//! The in-process event bus. Subscribers register per event kind and are
//! invoked sequentially in registration order; a panicking subscriber is
//! isolated from the others and from the data path.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use tracing::warn;

use crate::common::data::{EventKind, ProxyEvent};

pub type EventCallback = Arc<dyn Fn(&ProxyEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

struct Subscriber {
    id: usize,
    kind: EventKind,
    callback: EventCallback,
}

/// Fan-out of [`ProxyEvent`]s to registered observers.
///
/// The subscriber list is copy-on-write: emissions iterate a stable snapshot,
/// so subscribing from within a callback never deadlocks or changes the
/// current emission.
pub struct EventBus {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.subscribers.write().unwrap();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().map(|s| Subscriber {
            id: s.id,
            kind: s.kind,
            callback: s.callback.clone(),
        }));
        next.push(Subscriber { id, kind, callback });
        *guard = Arc::new(next);

        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut guard = self.subscribers.write().unwrap();
        let next: Vec<Subscriber> = guard
            .iter()
            .filter(|s| s.id != subscription.0)
            .map(|s| Subscriber {
                id: s.id,
                kind: s.kind,
                callback: s.callback.clone(),
            })
            .collect();
        *guard = Arc::new(next);
    }

    pub fn emit(&self, event: ProxyEvent) {
        let snapshot = self.subscribers.read().unwrap().clone();
        let kind = event.kind();

        for subscriber in snapshot.iter().filter(|s| s.kind == kind) {
            let callback = subscriber.callback.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!("event subscriber for {:?} panicked; continuing", kind);
            }
        }
    }
}
