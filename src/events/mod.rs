//! In-process publish/subscribe for run events.
//!
//! Listeners register for a `(run_id, category)` pair and are called
//! synchronously, in registration order, from inside [`EventBus::publish`].
//! Nothing is buffered: an event published before anyone subscribes is gone,
//! and clients recover it through the summary/pager catch-up path.
//!
//! The [`EventBus`] trait is the seam for a broker-backed implementation; the
//! in-memory one does not fan out across processes.

mod types;

pub use types::*;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

/// Callback invoked for each delivered event.
pub type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Publish/subscribe over a keyed channel registry.
pub trait EventBus: Send + Sync {
    /// Deliver `event` to the listeners of its category for `run_id`.
    /// Fire-and-forget; never fails.
    fn publish(&self, run_id: &str, event: BusEvent);

    /// Register a listener. The returned handle unsubscribes when dropped.
    fn subscribe(&self, run_id: &str, category: EventCategory, listener: Listener)
        -> Subscription;

    /// Number of listeners registered for a key.
    fn subscriber_count(&self, run_id: &str, category: EventCategory) -> usize;
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether the listener is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Key = (String, EventCategory);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<Key, Vec<(u64, Listener)>>,
}

/// Single-process [`EventBus`].
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        // Listeners never run under the lock, so a poisoned guard still holds
        // a consistent map.
        registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(registry: &Weak<Mutex<Registry>>, key: &Key, id: u64) {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let mut guard = Self::lock(&registry);
        if let Some(entries) = guard.listeners.get_mut(key) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                guard.listeners.remove(key);
            }
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, run_id: &str, event: BusEvent) {
        let category = event.category();
        let key = (run_id.to_string(), category);

        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener> = Self::lock(&self.registry)
            .listeners
            .get(&key)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        debug!(
            run_id = %run_id,
            category = %category,
            subscriber_count = listeners.len(),
            "EventBus publish"
        );

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(run_id = %run_id, category = %category, "Event listener panicked");
            }
        }
    }

    fn subscribe(
        &self,
        run_id: &str,
        category: EventCategory,
        listener: Listener,
    ) -> Subscription {
        let key = (run_id.to_string(), category);
        let id = {
            let mut guard = Self::lock(&self.registry);
            guard.next_id += 1;
            let id = guard.next_id;
            guard
                .listeners
                .entry(key.clone())
                .or_default()
                .push((id, listener));
            id
        };

        let registry = Arc::downgrade(&self.registry);
        Subscription::new(move || Self::remove(&registry, &key, id))
    }

    fn subscriber_count(&self, run_id: &str, category: EventCategory) -> usize {
        Self::lock(&self.registry)
            .listeners
            .get(&(run_id.to_string(), category))
            .map_or(0, Vec::len)
    }
}
