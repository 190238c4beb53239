use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::subscription::{Listener, Subscribers, Subscription};
use super::types::{PermissionPatch, PermissionRecord};
use crate::core::error::Result;
use crate::schema::{BROADCAST_EVENT, DEFAULT_STORAGE_KEY, PermissionSchema, SchemaPreset};
use crate::sync::{BroadcastMessage, Broadcaster, HandlerId, PersistenceBackend, StorageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeSource {
    Storage,
    Broadcast,
}

#[derive(Default)]
struct Revisions {
    /// Bumped by every state change, local or external.
    local: u64,
    /// Highest broadcast sequence applied per foreign origin.
    remote: HashMap<Uuid, u64>,
}

struct Inner {
    id: Uuid,
    schema: PermissionSchema,
    storage_key: String,
    event_name: String,
    state: RwLock<PermissionRecord>,
    /// Serializes every state change together with its persistence write.
    /// Never held while subscribers or the broadcaster run.
    revisions: Mutex<Revisions>,
    subscribers: Subscribers,
    persistence: Arc<dyn PersistenceBackend>,
    broadcaster: Arc<dyn Broadcaster>,
    storage_handler: HandlerId,
    broadcast_handler: HandlerId,
}

/// Observable permission state for one context.
///
/// Cloning is cheap and every clone shares the same state. Stores built in
/// the same document on the same [`Broadcaster`] converge through broadcast
/// messages; stores in different contexts converge through storage-change
/// notifications from their [`PersistenceBackend`]. When the last clone is
/// dropped the store removes its handlers from both collaborators.
#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<Inner>,
}

pub struct PermissionStoreBuilder {
    schema: PermissionSchema,
    storage_key: String,
    event_name: String,
    persistence: Arc<dyn PersistenceBackend>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PermissionStoreBuilder {
    #[must_use]
    pub fn schema(mut self, schema: PermissionSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Uses a preset schema together with the storage key that preset has
    /// always been persisted under.
    #[must_use]
    pub fn preset(mut self, preset: SchemaPreset) -> Self {
        self.schema = PermissionSchema::preset(preset);
        self.storage_key = preset.storage_key().to_string();
        self
    }

    #[must_use]
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    #[must_use]
    pub fn build(self) -> PermissionStore {
        let id = Uuid::new_v4();
        let initial = load_from_storage(self.persistence.as_ref(), &self.storage_key, &self.schema);
        tracing::debug!(store = %id, permissions = %initial, "Permission store ready");

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_storage = weak.clone();
            let storage_handler =
                self.persistence
                    .on_change(Arc::new(move |event: &StorageEvent| {
                        if let Some(inner) = on_storage.upgrade() {
                            inner.handle_storage_event(event);
                        }
                    }));

            let on_broadcast = weak.clone();
            let broadcast_handler =
                self.broadcaster
                    .on_receive(Arc::new(move |message: &BroadcastMessage| {
                        if let Some(inner) = on_broadcast.upgrade() {
                            inner.handle_broadcast(message);
                        }
                    }));

            Inner {
                id,
                schema: self.schema,
                storage_key: self.storage_key,
                event_name: self.event_name,
                state: RwLock::new(initial),
                revisions: Mutex::new(Revisions::default()),
                subscribers: Subscribers::default(),
                persistence: self.persistence,
                broadcaster: self.broadcaster,
                storage_handler,
                broadcast_handler,
            }
        });

        PermissionStore { inner }
    }
}

fn load_from_storage(
    persistence: &dyn PersistenceBackend,
    key: &str,
    schema: &PermissionSchema,
) -> PermissionRecord {
    let stored = match persistence.read(key) {
        Ok(Some(stored)) => stored,
        Ok(None) => return PermissionRecord::defaults(schema),
        Err(e) => {
            tracing::warn!(key, "Failed to read persisted permissions, using defaults: {}", e);
            return PermissionRecord::defaults(schema);
        }
    };

    PermissionRecord::from_json(schema, &stored).unwrap_or_else(|e| {
        tracing::warn!(key, "Discarding persisted permissions, using defaults: {}", e);
        PermissionRecord::defaults(schema)
    })
}

impl PermissionStore {
    #[must_use]
    pub fn builder(
        persistence: Arc<dyn PersistenceBackend>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> PermissionStoreBuilder {
        PermissionStoreBuilder {
            schema: PermissionSchema::default(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            event_name: BROADCAST_EVENT.to_string(),
            persistence,
            broadcaster,
        }
    }

    #[must_use]
    pub fn new(
        schema: PermissionSchema,
        persistence: Arc<dyn PersistenceBackend>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self::builder(persistence, broadcaster)
            .schema(schema)
            .build()
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn schema(&self) -> &PermissionSchema {
        &self.inner.schema
    }

    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    #[must_use]
    pub fn snapshot(&self) -> PermissionRecord {
        self.inner.state.read().clone()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.inner.state.read().is_granted(name)
    }

    /// Merges `patch` into the current record, persists the result, notifies
    /// subscribers and broadcasts to the rest of the document.
    ///
    /// Only a patch naming an unknown permission is an error; in that case
    /// nothing changes. Persistence failures are logged and the new state is
    /// kept in memory.
    ///
    /// Concurrent updates are applied one at a time: the merge, the state swap
    /// and the persistence write of one update finish before the next update
    /// merges, so storage always ends up holding the newest record.
    pub fn update(&self, patch: &PermissionPatch) -> Result<()> {
        let inner = &self.inner;
        let (next, payload, revision) = {
            let mut revisions = inner.revisions.lock();
            let next = {
                let mut state = inner.state.write();
                let next = state.merged(patch)?;
                *state = next.clone();
                next
            };
            revisions.local += 1;
            let revision = revisions.local;
            tracing::debug!(store = %inner.id, revision, permissions = %next, "Permissions updated");

            let payload = inner.persist(&next);
            (next, payload, revision)
        };

        inner.subscribers.notify(&next, revision);

        if let Some(payload) = payload {
            inner.broadcaster.send(
                &BroadcastMessage::new(inner.id, &inner.event_name, payload).with_sequence(revision),
            );
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        let defaults = PermissionRecord::defaults(&self.inner.schema);
        self.update(&PermissionPatch::from(&defaults))
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PermissionRecord) + Send + Sync + 'static,
    {
        self.subscribe_shared(Arc::new(listener))
    }

    pub fn subscribe_shared(&self, listener: Listener) -> Subscription {
        self.inner.subscribers.add(listener)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Inner {
    /// Writes the full record under the storage key. Returns the serialized
    /// record for broadcasting, or `None` if it could not be serialized.
    fn persist(&self, record: &PermissionRecord) -> Option<String> {
        let payload = match record.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize permissions: {}", e);
                return None;
            }
        };

        if let Err(e) = self.persistence.write(&self.storage_key, &payload) {
            tracing::warn!(
                key = %self.storage_key,
                "Failed to persist permissions: {}. Change kept in memory only.",
                e
            );
        }
        Some(payload)
    }

    fn handle_storage_event(&self, event: &StorageEvent) {
        if event.key != self.storage_key {
            return;
        }
        let Some(new_value) = event.new_value.as_deref() else {
            return;
        };
        self.apply_external(new_value, ChangeSource::Storage, None);
    }

    fn handle_broadcast(&self, message: &BroadcastMessage) {
        if message.event != self.event_name || message.origin == self.id {
            return;
        }
        let sequence = (message.sequence > 0).then_some((message.origin, message.sequence));
        self.apply_external(&message.payload, ChangeSource::Broadcast, sequence);
    }

    /// Replaces state with an externally originated record. Never persists or
    /// broadcasts, so a change cannot loop between contexts. A numbered
    /// broadcast older than one already applied from the same origin is
    /// dropped.
    fn apply_external(
        &self,
        payload: &str,
        source: ChangeSource,
        sequence: Option<(Uuid, u64)>,
    ) {
        let record = match PermissionRecord::from_json(&self.schema, payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(store = %self.id, ?source, "Dropping external permission change: {}", e);
                return;
            }
        };

        let revision = {
            let mut revisions = self.revisions.lock();
            if let Some((origin, sequence)) = sequence {
                let last = revisions.remote.entry(origin).or_insert(0);
                if sequence <= *last {
                    tracing::debug!(store = %self.id, %origin, sequence, "Ignoring out-of-order broadcast");
                    return;
                }
                *last = sequence;
            }
            *self.state.write() = record.clone();
            revisions.local += 1;
            revisions.local
        };
        tracing::debug!(store = %self.id, ?source, revision, permissions = %record, "Received permissions");
        self.subscribers.notify(&record, revision);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.persistence.remove_handler(self.storage_handler);
        self.broadcaster.remove_handler(self.broadcast_handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StoreError;
    use crate::sync::{DocumentBus, FileStorage, SharedStorage, StorageContext, StorageHandler};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Storage whose first write stalls, so a second update can arrive while
    /// the first is still being persisted.
    struct SlowFirstWrite {
        context: StorageContext,
        stalled: AtomicBool,
    }

    impl PersistenceBackend for SlowFirstWrite {
        fn read(&self, key: &str) -> Result<Option<String>> {
            self.context.read(key)
        }

        fn write(&self, key: &str, value: &str) -> Result<()> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            self.context.write(key, value)
        }

        fn on_change(&self, handler: StorageHandler) -> HandlerId {
            self.context.on_change(handler)
        }

        fn remove_handler(&self, id: HandlerId) {
            self.context.remove_handler(id);
        }
    }

    fn ab_schema() -> PermissionSchema {
        PermissionSchema::new([("a", false), ("b", false)]).unwrap()
    }

    fn create_test_store(schema: PermissionSchema) -> (PermissionStore, SharedStorage) {
        let storage = SharedStorage::new();
        let store = PermissionStore::new(
            schema,
            Arc::new(storage.context()),
            Arc::new(DocumentBus::new()),
        );
        (store, storage)
    }

    #[test]
    fn test_defaults_without_persisted_data() {
        let (store, storage) = create_test_store(PermissionSchema::microfrontend());
        let snapshot = store.snapshot();

        for (name, default) in PermissionSchema::microfrontend().entries() {
            assert_eq!(snapshot.get(name), Some(default), "{name}");
        }
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn test_update_is_a_patch() {
        let (store, _storage) = create_test_store(ab_schema());

        store.update(&PermissionPatch::new().with("a", true)).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get("a"), Some(true));
        assert_eq!(snapshot.get("b"), Some(false));
    }

    #[test]
    fn test_update_persists_full_record() {
        let (store, storage) = create_test_store(ab_schema());

        store.update(&PermissionPatch::new().with("b", true)).unwrap();

        assert_eq!(
            storage.get(DEFAULT_STORAGE_KEY).as_deref(),
            Some(r#"{"a":false,"b":true}"#)
        );
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn test_unknown_permission_leaves_state_untouched() {
        let (store, storage) = create_test_store(ab_schema());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = store
            .update(&PermissionPatch::new().with("a", true).with("canFly", true))
            .unwrap_err();

        assert!(matches!(err, StoreError::UnknownPermission(_)));
        assert_eq!(store.snapshot().get("a"), Some(false));
        assert_eq!(storage.write_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let (store, _storage) = create_test_store(ab_schema());
        let before = store.snapshot();

        store.update(&PermissionPatch::new().with("a", true)).unwrap();

        assert_eq!(before.get("a"), Some(false));
    }

    #[test]
    fn test_notifications_in_registration_order() {
        let (store, _storage) = create_test_store(ab_schema());
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                store.subscribe(move |_| order.lock().push(i))
            })
            .collect();

        store.update(&PermissionPatch::new().with("a", true)).unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(store.subscriber_count(), subs.len());
    }

    #[test]
    fn test_subscriber_may_reenter_store() {
        let (store, _storage) = create_test_store(ab_schema());
        let seen = Arc::new(Mutex::new(None));

        let reader = store.clone();
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(move |_| {
            *sink.lock() = Some(reader.has("a"));
        });

        store.update(&PermissionPatch::new().with("a", true)).unwrap();
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let (store, storage) = create_test_store(ab_schema());
        storage.set_read_only(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.update(&PermissionPatch::new().with("a", true)).unwrap();

        assert!(store.has("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(storage.get(DEFAULT_STORAGE_KEY), None);
    }

    #[test]
    fn test_loads_persisted_over_defaults() {
        let storage = SharedStorage::new();
        storage.seed(DEFAULT_STORAGE_KEY, r#"{"canAccessAdmin":true}"#);

        let store = PermissionStore::new(
            PermissionSchema::microfrontend(),
            Arc::new(storage.context()),
            Arc::new(DocumentBus::new()),
        );

        assert!(store.has("canAccessAdmin"));
        assert!(store.has("canAccessRemote1"));
    }

    #[test]
    fn test_preset_uses_its_storage_key() {
        let storage = SharedStorage::new();
        storage.seed("userPermissions", r#"{"canEditData":true}"#);

        let store = PermissionStore::builder(
            Arc::new(storage.context()),
            Arc::new(DocumentBus::new()),
        )
        .preset(SchemaPreset::Widget)
        .build();

        assert_eq!(store.storage_key(), "userPermissions");
        assert!(store.has("canEditData"));
        assert!(!store.has("canViewWidget"));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let (store, _storage) = create_test_store(PermissionSchema::microfrontend());
        store
            .update(
                &PermissionPatch::new()
                    .with("canAccessAdmin", true)
                    .with("canAccessRemote1", false),
            )
            .unwrap();

        store.reset().unwrap();

        assert_eq!(
            store.snapshot(),
            PermissionRecord::defaults(&PermissionSchema::microfrontend())
        );
    }

    #[test]
    fn test_own_broadcast_is_ignored() {
        let storage = SharedStorage::new();
        let bus = Arc::new(DocumentBus::new());
        let store = PermissionStore::new(ab_schema(), Arc::new(storage.context()), bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.update(&PermissionPatch::new().with("a", true)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_foreign_event_name_is_ignored() {
        let bus = Arc::new(DocumentBus::new());
        let store = PermissionStore::new(
            ab_schema(),
            Arc::new(SharedStorage::new().context()),
            Arc::clone(&bus) as Arc<dyn Broadcaster>,
        );

        bus.send(&BroadcastMessage::new(
            Uuid::new_v4(),
            "theme-updated",
            r#"{"a":true}"#,
        ));

        assert!(!store.has("a"));
    }

    #[test]
    fn test_concurrent_updates_persist_newest_record() {
        let storage = SharedStorage::new();
        let backend = SlowFirstWrite {
            context: storage.context(),
            stalled: AtomicBool::new(false),
        };
        let store = PermissionStore::new(ab_schema(), Arc::new(backend), Arc::new(DocumentBus::new()));

        let last_seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last_seen);
        let _sub = store.subscribe(move |record| {
            *sink.lock() = Some(record.clone());
        });

        let first = {
            let store = store.clone();
            thread::spawn(move || store.update(&PermissionPatch::new().with("a", true)))
        };
        thread::sleep(Duration::from_millis(50));
        store.update(&PermissionPatch::new().with("b", true)).unwrap();
        first.join().unwrap().unwrap();

        let memory = store.snapshot();
        assert!(memory.is_granted("a"));
        assert!(memory.is_granted("b"));
        assert_eq!(storage.get(DEFAULT_STORAGE_KEY), Some(memory.to_json().unwrap()));
        assert_eq!(last_seen.lock().as_ref(), Some(&memory));
    }

    #[test]
    fn test_stale_broadcast_from_same_origin_is_ignored() {
        let bus = Arc::new(DocumentBus::new());
        let store = PermissionStore::new(
            ab_schema(),
            Arc::new(SharedStorage::new().context()),
            Arc::clone(&bus) as Arc<dyn Broadcaster>,
        );
        let origin = Uuid::new_v4();

        bus.send(&BroadcastMessage::new(origin, BROADCAST_EVENT, r#"{"a":true,"b":true}"#).with_sequence(2));
        bus.send(&BroadcastMessage::new(origin, BROADCAST_EVENT, r#"{"a":true,"b":false}"#).with_sequence(1));
        assert!(store.has("b"));

        bus.send(&BroadcastMessage::new(Uuid::new_v4(), BROADCAST_EVENT, r#"{"a":false,"b":false}"#));
        assert!(!store.has("b"));
    }

    #[test]
    fn test_dropped_stores_release_their_handlers() {
        let storage = SharedStorage::new();
        let context = Arc::new(storage.context());
        let bus = Arc::new(DocumentBus::new());

        for _ in 0..100 {
            let store = PermissionStore::new(ab_schema(), Arc::clone(&context) as _, Arc::clone(&bus) as _);
            drop(store);
        }
        assert_eq!(bus.handler_count(), 0);
        assert_eq!(context.handler_count(), 0);

        let store = PermissionStore::new(ab_schema(), Arc::clone(&context) as _, Arc::clone(&bus) as _);
        let clone = store.clone();
        drop(store);
        assert_eq!(bus.handler_count(), 1);
        assert_eq!(context.handler_count(), 1);
        drop(clone);
        assert_eq!(bus.handler_count(), 0);
        assert_eq!(context.handler_count(), 0);
    }

    #[test]
    fn test_dropped_store_releases_file_storage_handler() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let file = Arc::new(FileStorage::new(temp_dir.path().join("storage.json")));

        let store = PermissionStore::new(ab_schema(), Arc::clone(&file) as _, Arc::new(DocumentBus::new()));
        assert_eq!(file.handler_count(), 1);
        drop(store);
        assert_eq!(file.handler_count(), 0);
    }
}
