use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use super::types::PermissionRecord;

pub type Listener = Arc<dyn Fn(&PermissionRecord) + Send + Sync>;

struct Entry {
    id: u64,
    listener: Listener,
    /// Revision of the last record handed to this listener. Held for the
    /// duration of a call so deliveries to one listener never overlap.
    delivered: ReentrantMutex<Cell<u64>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Arc<Entry>>,
}

/// Ordered set of listeners. Notification runs outside the registry lock so
/// listeners may subscribe, unsubscribe or update the store they belong to.
///
/// Every record carries the store revision it was produced at. A listener
/// never receives a revision older than one it has already seen, even when
/// two threads notify at once. A listener must not block on another thread
/// that notifies the same store.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    registry: Arc<Mutex<Registry>>,
}

impl Subscribers {
    pub(crate) fn add(&self, listener: Listener) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push(Arc::new(Entry {
            id,
            listener,
            delivered: ReentrantMutex::new(Cell::new(0)),
        }));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    /// Calls every listener registered at the time of the call, in
    /// registration order. A panicking listener is logged and skipped; a
    /// listener that already saw a newer `revision` is skipped silently.
    pub(crate) fn notify(&self, record: &PermissionRecord, revision: u64) {
        let listeners: Vec<Arc<Entry>> = self.registry.lock().listeners.clone();
        tracing::debug!(count = listeners.len(), revision, "Notifying permission subscribers");

        for entry in listeners {
            let delivered = entry.delivered.lock();
            if delivered.get() >= revision {
                tracing::debug!(subscriber = entry.id, revision, "Skipping superseded record");
                continue;
            }
            delivered.set(revision);

            let snapshot = record.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (entry.listener)(&snapshot))) {
                tracing::error!(
                    subscriber = entry.id,
                    "Permission subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle returned by [`PermissionStore::subscribe`](super::PermissionStore::subscribe).
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`]
/// on teardown.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes exactly this registration. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry.lock().listeners.retain(|entry| entry.id != self.id);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.lock().listeners.iter().any(|entry| entry.id == self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PermissionSchema;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record() -> PermissionRecord {
        PermissionRecord::defaults(&PermissionSchema::widget())
    }

    fn counter(count: &Arc<AtomicUsize>) -> Listener {
        let count = Arc::clone(count);
        Arc::new(move |_: &PermissionRecord| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_same_listener_twice_is_two_subscriptions() {
        let subscribers = Subscribers::default();
        let count = Arc::new(AtomicUsize::new(0));
        let listener = counter(&count);

        let first = subscribers.add(Arc::clone(&listener));
        let _second = subscribers.add(listener);

        subscribers.notify(&record(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        first.unsubscribe();
        subscribers.notify(&record(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_older_revision_is_not_delivered_after_newer() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = subscribers.add(Arc::new(move |record: &PermissionRecord| {
            sink.lock().push(record.is_granted("canViewWidget"));
        }));

        let newer = record()
            .merged(&crate::permission::PermissionPatch::new().with("canViewWidget", true))
            .unwrap();
        subscribers.notify(&newer, 2);
        subscribers.notify(&record(), 1);
        subscribers.notify(&newer, 2);

        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn test_listener_may_trigger_nested_notification() {
        let subscribers = Subscribers::default();
        let count = Arc::new(AtomicUsize::new(0));

        let nested = subscribers.clone();
        let inner_count = Arc::clone(&count);
        let _subscription = subscribers.add(Arc::new(move |record: &PermissionRecord| {
            if inner_count.fetch_add(1, Ordering::SeqCst) == 0 {
                nested.notify(record, 2);
            }
        }));

        subscribers.notify(&record(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let subscribers = Subscribers::default();
        let count = Arc::new(AtomicUsize::new(0));
        let subscription = subscribers.add(counter(&count));

        subscription.unsubscribe();
        subscription.unsubscribe();

        assert!(!subscription.is_active());
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let subscribers = Subscribers::default();
        let subscription = subscribers.add(Arc::new(|_: &PermissionRecord| {}));
        drop(subscribers);

        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
