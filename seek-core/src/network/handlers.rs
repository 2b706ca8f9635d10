//! Typed callback registries. Every subscriber runs in its own `catch_unwind` so one
//! panicking observer cannot take down the read loop that is dispatching to it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Handle returned by [`EventHandlers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventHandlers<E> {
    subscribers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHandlers<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber in subscription order. Handlers are snapshotted first, so a
    /// handler may subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in snapshot {
            invoke_isolated("event handler", || handler(event));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Handler<E>)>> {
        // Handlers never run under this lock, so poisoning can only come from a Vec op.
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E> Default for EventHandlers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventHandlers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Run a user callback, logging instead of unwinding if it panics.
pub(crate) fn invoke_isolated(context: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(context, %message, "subscriber panicked");
    }
}
