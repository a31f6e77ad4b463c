//! Callback registry used for every event subscription in the crate

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A registered event callback
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entries<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

/// Ordered set of listeners, removable by handle
pub struct ListenerRegistry<E> {
    inner: Arc<Entries<E>>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clones share one set of listeners
impl<E> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Entries {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback; dropping the returned handle does not unsubscribe
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription
    where
        E: 'static,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    pub fn subscribe_arc(&self, listener: Listener<E>) -> Subscription
    where
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, listener));

        let weak: Weak<Entries<E>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(entries) = weak.upgrade() {
                entries.listeners.lock().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Deliver an event to every listener in registration order.
    ///
    /// The lock is released before callbacks run, so a listener may
    /// subscribe or unsubscribe while being notified.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`; `unsubscribe` may be called any number of times
pub struct Subscription {
    done: AtomicBool,
    remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            done: AtomicBool::new(false),
            remove: Box::new(remove),
        }
    }

    /// A handle with nothing to remove
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.remove)();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
