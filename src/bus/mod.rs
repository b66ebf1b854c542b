// ABOUTME: Message bus abstraction shared by every coordination component
//
// The bus itself is an external collaborator. This module only fixes the
// interface the rest of the crate talks to:
// - Message: a named message with a JSON object payload
// - Handler: plain data (message type + predicate) plus a callback
// - MessageBus: publish / add_handler / remove_handler
// - registry: scoped handler registrations that deregister exactly once
// - memory: in-process loopback bus for tests and embedding

/// Loopback bus
pub mod memory;
/// Handler lifetimes
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::InMemoryBus;
pub use registry::HandlerRegistration;

/// Payload carried by every bus message (always a JSON object).
pub type Payload = serde_json::Map<String, Value>;

// === Message ===

/// A named message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, e.g. `getProjectResponse`
    #[serde(rename = "type")]
    pub kind: String,

    /// Message fields
    pub payload: Payload,
}

impl Message {
    /// Create a new message
    pub fn new(kind: impl Into<String>, payload: Payload) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Get a string field from the payload
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Check whether a string field is present and equal to `expected`
    pub fn field_equals(&self, field: &str, expected: &str) -> bool {
        self.str_field(field) == Some(expected)
    }
}

// === Handler ===

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Allocate a fresh handler id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;
type Callback = Box<dyn Fn(&Message) + Send + Sync>;

/// A bus handler: the message type it watches, a predicate over the
/// payload, and the callback invoked for every accepted message.
///
/// Callbacks may run concurrently with each other and with the code
/// that registered them.
pub struct Handler {
    id: HandlerId,
    message_type: String,
    predicate: Predicate,
    callback: Callback,
}

impl Handler {
    /// Create a handler with a caller-supplied id
    ///
    /// The id is allocated up front (see [`HandlerRegistration::reserve`])
    /// so a callback can deregister its own handler.
    pub fn new<P, C>(id: HandlerId, message_type: impl Into<String>, predicate: P, callback: C) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        C: Fn(&Message) + Send + Sync + 'static,
    {
        Self {
            id,
            message_type: message_type.into(),
            predicate: Box::new(predicate),
            callback: Box::new(callback),
        }
    }

    /// Handler id
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Watched message type
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Whether this handler accepts the message
    pub fn can_handle(&self, message: &Message) -> bool {
        message.kind == self.message_type && (self.predicate)(message)
    }

    /// Invoke the callback
    pub fn handle(&self, message: &Message) {
        (self.callback)(message);
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

// === Bus ===

/// Errors reported by a bus implementation
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus connection is gone
    #[error("Message bus is disconnected")]
    Disconnected,

    /// The bus refused the message
    #[error("Message '{kind}' rejected: {reason}")]
    Rejected {
        /// Message type
        kind: String,
        /// Reason given by the bus
        reason: String,
    },

    /// Payload could not be encoded
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe bus used by all components.
///
/// Delivery order across handlers is unspecified and handlers may be
/// invoked concurrently. Implementations must tolerate handlers being
/// added or removed from inside a callback.
pub trait MessageBus: Send + Sync {
    /// Publish a message to every matching handler
    fn publish(&self, kind: &str, payload: Payload) -> Result<(), BusError>;

    /// Install a handler
    fn add_handler(&self, handler: Arc<Handler>);

    /// Remove a handler, returning whether it was installed
    fn remove_handler(&self, id: HandlerId) -> bool;
}
