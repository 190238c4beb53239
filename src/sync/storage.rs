use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{HandlerId, HandlerList};
use crate::core::error::{Result, StoreError};

/// Storage events a context holds before it starts discarding the oldest.
/// A context that never dispatches would otherwise grow without bound.
pub const MAX_PENDING_EVENTS: usize = 1024;

/// Fired in every *other* context when a storage entry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub type StorageHandler = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Durable per-origin key/value storage as seen from one browsing context.
pub trait PersistenceBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;

    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Registers `handler` for changes made by other contexts. Writes made
    /// through this backend never reach its own handlers.
    fn on_change(&self, handler: StorageHandler) -> HandlerId;

    /// Removes a registration made by [`PersistenceBackend::on_change`].
    /// Unknown ids are ignored.
    fn remove_handler(&self, id: HandlerId);
}

#[derive(Default)]
struct ContextSlot {
    handlers: HandlerList<StorageHandler>,
    pending: VecDeque<StorageEvent>,
}

impl ContextSlot {
    fn enqueue(&mut self, context: u64, event: StorageEvent) {
        if self.pending.len() >= MAX_PENDING_EVENTS {
            let dropped = self.pending.pop_front();
            tracing::warn!(
                context,
                key = dropped.as_ref().map(|e| e.key.as_str()),
                "Storage event queue full, discarding oldest event"
            );
        }
        self.pending.push_back(event);
    }
}

#[derive(Default)]
struct Area {
    entries: HashMap<String, String>,
    contexts: HashMap<u64, ContextSlot>,
    next_context: u64,
    writes: usize,
    read_only: bool,
}

/// In-memory storage area shared by every context of one origin.
///
/// Each [`StorageContext`] plays one tab. A write through a context queues a
/// [`StorageEvent`] for every other live context; the event is delivered when
/// that context calls [`StorageContext::dispatch_pending`], mirroring the
/// browser delivering storage notifications as a separate task. Each context
/// keeps at most [`MAX_PENDING_EVENTS`] undelivered events; past that the
/// oldest are discarded, so the latest value of every key still arrives.
#[derive(Clone, Default)]
pub struct SharedStorage {
    area: Arc<Mutex<Area>>,
}

impl SharedStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn context(&self) -> StorageContext {
        let mut area = self.area.lock();
        let id = area.next_context;
        area.next_context += 1;
        area.contexts.insert(id, ContextSlot::default());
        StorageContext {
            id,
            area: Arc::clone(&self.area),
        }
    }

    /// Sets an entry directly, without notifying any context.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.area.lock().entries.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.area.lock().entries.get(key).cloned()
    }

    /// Number of successful writes through any context.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.area.lock().writes
    }

    /// Makes every write fail, as storage does when the quota is exhausted or
    /// the page runs in a private mode.
    pub fn set_read_only(&self, read_only: bool) {
        self.area.lock().read_only = read_only;
    }
}

/// One context's handle onto a [`SharedStorage`] area.
pub struct StorageContext {
    id: u64,
    area: Arc<Mutex<Area>>,
}

impl StorageContext {
    /// Delivers queued storage events to this context's handlers and returns
    /// how many were delivered.
    pub fn dispatch_pending(&self) -> usize {
        let (events, handlers) = {
            let mut area = self.area.lock();
            let Some(slot) = area.contexts.get_mut(&self.id) else {
                return 0;
            };
            let events: Vec<StorageEvent> = slot.pending.drain(..).collect();
            (events, slot.handlers.snapshot())
        };

        for event in &events {
            for handler in &handlers {
                handler(event);
            }
        }
        events.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.area
            .lock()
            .contexts
            .get(&self.id)
            .map_or(0, |slot| slot.pending.len())
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.area
            .lock()
            .contexts
            .get(&self.id)
            .map_or(0, |slot| slot.handlers.len())
    }
}

impl PersistenceBackend for StorageContext {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.area.lock().entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut area = self.area.lock();
        if area.read_only {
            return Err(StoreError::PersistenceWrite(
                "storage quota exceeded".to_string(),
            ));
        }

        let old_value = area.entries.insert(key.to_string(), value.to_string());
        area.writes += 1;

        let event = StorageEvent {
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_string()),
        };
        for (id, slot) in &mut area.contexts {
            if *id != self.id {
                slot.enqueue(*id, event.clone());
            }
        }
        Ok(())
    }

    fn on_change(&self, handler: StorageHandler) -> HandlerId {
        self.area
            .lock()
            .contexts
            .entry(self.id)
            .or_default()
            .handlers
            .add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        if let Some(slot) = self.area.lock().contexts.get_mut(&self.id) {
            slot.handlers.remove(id);
        }
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        self.area.lock().contexts.remove(&self.id);
    }
}
