// ABOUTME: In-process loopback message bus
//
// Dispatches every published message synchronously, on the publisher's
// task, to a snapshot of the handlers that accept it. No lock is held while
// callbacks run, so handlers may publish, add or remove handlers
// re-entrantly. Keeps a journal of published messages for inspection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::trace;

use super::{BusError, Handler, HandlerId, Message, MessageBus, Payload};

/// Loopback bus used by tests, the self-test command and embedders that
/// run every participant in one process.
#[derive(Default)]
pub struct InMemoryBus {
    handlers: RwLock<Vec<Arc<Handler>>>,
    journal: Mutex<Vec<Message>>,
    disconnected: AtomicBool,
}

impl InMemoryBus {
    /// Create an empty, connected bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of installed handlers watching a message type
    pub fn handlers_for(&self, kind: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.message_type() == kind)
            .count()
    }

    /// All messages published so far, in publish order
    pub fn published(&self) -> Vec<Message> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Published messages of one type
    pub fn published_of(&self, kind: &str) -> Vec<Message> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    /// Simulate losing the connection; later publishes fail
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restore the connection
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, kind: &str, payload: Payload) -> Result<(), BusError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        let message = Message::new(kind, payload);
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        let matching: Vec<Arc<Handler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.can_handle(&message))
            .cloned()
            .collect();

        trace!(kind = %kind, handlers = matching.len(), "Dispatching message");

        for handler in matching {
            handler.handle(&message);
        }
        Ok(())
    }

    fn add_handler(&self, handler: Arc<Handler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| h.id() != id);
        before != handlers.len()
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("handlers", &self.handler_count())
            .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
