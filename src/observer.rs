//! Synchronous observer lists with explicit unsubscribe tokens.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token returned by every `subscribe`/`register` call.
///
/// Dropping a `Subscription` leaves the listener attached; call
/// [`Subscription::unsubscribe`] to detach it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Listener<T>>>,
}

/// A set of listeners notified synchronously, in subscription order.
pub struct ObserverSet<T> {
    inner: Arc<Listeners<T>>,
}

impl<T: 'static> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Listeners {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.entries).insert(id, Arc::new(listener));

        let weak: Weak<Listeners<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.entries).remove(&id);
            }
        })
    }

    /// Deliver `value` to every listener. Listeners run outside the lock,
    /// so they may subscribe or unsubscribe re-entrantly.
    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.inner.entries).values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
