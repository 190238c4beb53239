use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use super::{HandlerId, HandlerList};

/// A same-document notification. `payload` is the JSON-serialized record.
///
/// `sequence` increases with every message one origin sends; `0` marks a
/// sender that does not number its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub origin: Uuid,
    pub sequence: u64,
    pub event: String,
    pub payload: String,
}

impl BroadcastMessage {
    #[must_use]
    pub fn new(origin: Uuid, event: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            origin,
            sequence: 0,
            event: event.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

pub type BroadcastHandler = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;

/// Delivers messages between stores that cannot share in-memory state.
pub trait Broadcaster: Send + Sync {
    fn send(&self, message: &BroadcastMessage);

    /// Registers `handler` for every message sent after this call.
    fn on_receive(&self, handler: BroadcastHandler) -> HandlerId;

    /// Removes a registration made by [`Broadcaster::on_receive`]. Unknown
    /// ids are ignored.
    fn remove_handler(&self, id: HandlerId);
}

/// Synchronous in-process bus standing in for one document's event target.
///
/// Handlers run on the sender's thread, in registration order, before
/// [`Broadcaster::send`] returns. The sender receives its own messages;
/// receivers filter by origin.
pub struct DocumentBus {
    handlers: RwLock<HandlerList<BroadcastHandler>>,
}

impl DocumentBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HandlerList::new()),
        }
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for DocumentBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for DocumentBus {
    fn send(&self, message: &BroadcastMessage) {
        let handlers = self.handlers.read().snapshot();
        tracing::trace!(
            event = %message.event,
            origin = %message.origin,
            receivers = handlers.len(),
            "Dispatching document event"
        );
        for handler in &handlers {
            handler(message);
        }
    }

    fn on_receive(&self, handler: BroadcastHandler) -> HandlerId {
        self.handlers.write().add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_bus_delivers_to_all_handlers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = DocumentBus::new();

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on_receive(Arc::new(move |msg: &BroadcastMessage| {
                seen.lock().unwrap().push(format!("{tag}:{}", msg.payload));
            }));
        }

        bus.send(&BroadcastMessage::new(Uuid::new_v4(), "evt", "{}"));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["first:{}", "second:{}"]);
        assert_eq!(bus.handler_count(), 2);
    }

    #[test]
    fn test_handler_may_send_reentrantly() {
        let bus = Arc::new(DocumentBus::new());
        let count = Arc::new(Mutex::new(0));

        let inner_bus = Arc::clone(&bus);
        let inner_count = Arc::clone(&count);
        bus.on_receive(Arc::new(move |msg: &BroadcastMessage| {
            *inner_count.lock().unwrap() += 1;
            if msg.event == "ping" {
                inner_bus.send(&BroadcastMessage::new(msg.origin, "pong", ""));
            }
        }));

        bus.send(&BroadcastMessage::new(Uuid::new_v4(), "ping", ""));
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_removed_handler_stops_receiving() {
        let bus = DocumentBus::new();
        let count = Arc::new(Mutex::new(0));

        let inner_count = Arc::clone(&count);
        let id = bus.on_receive(Arc::new(move |_: &BroadcastMessage| {
            *inner_count.lock().unwrap() += 1;
        }));
        bus.send(&BroadcastMessage::new(Uuid::new_v4(), "evt", ""));

        bus.remove_handler(id);
        bus.remove_handler(id);
        bus.send(&BroadcastMessage::new(Uuid::new_v4(), "evt", ""));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.handler_count(), 0);
    }
}
