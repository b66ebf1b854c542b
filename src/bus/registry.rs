// ABOUTME: Scoped handler registrations that deregister from the bus exactly once
//
// A registration is reserved first (so its handler id is known before the
// handler closure is built), then installed. Removal can race installation
// and can be requested any number of times; the handler leaves the bus
// exactly once and is never leaked.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{Handler, HandlerId, Message, MessageBus};

const RESERVED: u8 = 0;
const INSTALLED: u8 = 1;
const REMOVED: u8 = 2;

/// Lifetime of one handler on one bus.
///
/// Dropping the registration removes the handler. Note that a handler
/// whose callback owns its own registration keeps it alive; such owners
/// must call [`HandlerRegistration::remove`] explicitly.
pub struct HandlerRegistration {
    bus: Arc<dyn MessageBus>,
    id: HandlerId,
    state: AtomicU8,
}

impl HandlerRegistration {
    /// Reserve a handler id without installing anything yet
    pub fn reserve(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            id: HandlerId::next(),
            state: AtomicU8::new(RESERVED),
        }
    }

    /// Build and install a handler in one step
    pub fn register<P, C>(
        bus: Arc<dyn MessageBus>,
        message_type: &str,
        predicate: P,
        callback: C,
    ) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        C: Fn(&Message) + Send + Sync + 'static,
    {
        let registration = Self::reserve(bus);
        registration.install(Handler::new(registration.id, message_type, predicate, callback));
        registration
    }

    /// Id reserved for this registration
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Install the handler built for this registration
    ///
    /// Returns false if the registration was removed first (the handler is
    /// then taken straight back off the bus) or was already installed.
    pub fn install(&self, handler: Handler) -> bool {
        debug_assert_eq!(handler.id(), self.id, "handler built for another registration");

        let message_type = handler.message_type().to_string();
        self.bus.add_handler(Arc::new(handler));

        match self
            .state
            .compare_exchange(RESERVED, INSTALLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(handler = %self.id, message_type = %message_type, "Handler installed");
                true
            }
            Err(_) => {
                // Removed while installing: undo our own add
                self.bus.remove_handler(self.id);
                false
            }
        }
    }

    /// Whether the handler is currently installed
    pub fn is_installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSTALLED
    }

    /// Whether removal has been requested
    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == REMOVED
    }

    /// Remove the handler from the bus
    ///
    /// Returns true only for the call that performed the removal.
    pub fn remove(&self) -> bool {
        match self.state.swap(REMOVED, Ordering::AcqRel) {
            INSTALLED => {
                self.bus.remove_handler(self.id);
                debug!(handler = %self.id, "Handler removed");
                true
            }
            // Reserved: a concurrent install notices and undoes itself
            RESERVED => true,
            _ => false,
        }
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
