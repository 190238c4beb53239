pub mod broadcast;
pub mod file;
pub mod storage;

pub use broadcast::{BroadcastHandler, BroadcastMessage, Broadcaster, DocumentBus};
pub use file::FileStorage;
pub use storage::{
    MAX_PENDING_EVENTS, PersistenceBackend, SharedStorage, StorageContext, StorageEvent,
    StorageHandler,
};

/// Identifies one handler registration on a [`Broadcaster`] or
/// [`PersistenceBackend`] so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Ordered handler list shared by the in-process backends.
pub(crate) struct HandlerList<H> {
    next_id: u64,
    handlers: Vec<(HandlerId, H)>,
}

impl<H: Clone> HandlerList<H> {
    pub(crate) const fn new() -> Self {
        Self {
            next_id: 0,
            handlers: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _)| *existing != id);
        self.handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Copies the handlers out so callers can run them without holding a lock.
    pub(crate) fn snapshot(&self) -> Vec<H> {
        self.handlers.iter().map(|(_, h)| h.clone()).collect()
    }
}

impl<H: Clone> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}
