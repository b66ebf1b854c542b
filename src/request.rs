// ABOUTME: One-shot correlated request/response over the message bus
// ABOUTME: Publishes a request and resolves with the first matching reply or a timeout

//! Correlated requests.
//!
//! A [`CorrelatedRequest`] watches one reply type for messages whose
//! correlation fields match its [`CorrelationKey`], publishes the request,
//! and resolves exactly once:
//!
//! 1. the first matching reply is parsed (success or [`RequestError::Parse`]),
//! 2. or the deadline passes ([`RequestError::Timeout`]).
//!
//! Reply and timer race through a single result slot: whichever takes it
//! first decides the outcome and the loser is a no-op. The handler is
//! removed from the bus as soon as the slot is taken, so duplicate
//! deliveries and late replies are never consumed.
//!
//! # Example
//!
//! ```ignore
//! let key = CorrelationKey::for_user("kdvolder").with_callback_id(CallbackId::next());
//! let request = CorrelatedRequest::new(bus, GET_PROJECT_RESPONSE, key, decode::<GetProjectResponse>);
//! let listing = request.request(GET_PROJECT_REQUEST, payload).await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{BusError, Handler, HandlerRegistration, Message, MessageBus, Payload};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::protocol::{self, CallbackId, CALLBACK_ID, USERNAME};

// === Errors ===

/// Terminal failures of a correlated request
#[derive(Debug, Error)]
pub enum RequestError {
    /// No matching reply before the deadline
    #[error("No '{message_type}' reply within {timeout:?}")]
    Timeout {
        /// Watched reply type
        message_type: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// A matching reply arrived but could not be parsed
    #[error("Malformed '{message_type}' reply: {reason}")]
    Parse {
        /// Watched reply type
        message_type: String,
        /// Why parsing failed
        reason: String,
    },

    /// The request could not be published
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The request was resolved without producing an outcome
    #[error("Request abandoned before a reply arrived")]
    Abandoned,
}

/// Result type for correlated requests
pub type RequestResult<T> = Result<T, RequestError>;

// === Correlation Key ===

/// Fields a reply must echo to be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationKey {
    username: String,
    callback_id: Option<CallbackId>,
}

impl CorrelationKey {
    /// Match replies carrying this `username`
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            callback_id: None,
        }
    }

    /// Additionally require this `callback_id`
    #[must_use]
    pub const fn with_callback_id(mut self, callback_id: CallbackId) -> Self {
        self.callback_id = Some(callback_id);
        self
    }

    /// Correlated user
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Correlation id, if any
    pub const fn callback_id(&self) -> Option<CallbackId> {
        self.callback_id
    }

    /// Whether a reply carries the expected correlation fields
    pub fn matches(&self, message: &Message) -> bool {
        if !message.field_equals(USERNAME, &self.username) {
            return false;
        }
        match self.callback_id {
            Some(expected) => CallbackId::of(message) == Some(expected),
            None => true,
        }
    }

    /// Write the correlation fields into an outgoing payload
    pub fn stamp(&self, payload: &mut Payload) {
        payload.insert(USERNAME.to_string(), Value::String(self.username.clone()));
        if let Some(callback_id) = self.callback_id {
            payload.insert(CALLBACK_ID.to_string(), callback_id.to_value());
        }
    }
}

// === Parsing ===

/// Parse a reply payload with serde
///
/// Suitable as the parse function of a [`CorrelatedRequest`].
pub fn decode<T: DeserializeOwned>(message: &Message) -> Result<T, String> {
    protocol::from_payload(&message.payload).map_err(|e| e.to_string())
}

// === Correlated Request ===

type Outcome<T> = RequestResult<T>;

/// State shared between the waiting caller and the bus handler
struct Slot<T> {
    sender: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    registration: HandlerRegistration,
}

impl<T> Slot<T> {
    /// Take the right to resolve; only the first caller gets it
    fn claim(&self) -> Option<oneshot::Sender<Outcome<T>>> {
        let claimed = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if claimed.is_some() {
            self.registration.remove();
        }
        claimed
    }

    fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// A request that resolves with the first correlated reply.
///
/// The reply handler is installed on construction, so a reply cannot be
/// missed even if it arrives before [`CorrelatedRequest::await_result`]
/// is called. Dropping the request removes the handler.
pub struct CorrelatedRequest<T> {
    bus: Arc<dyn MessageBus>,
    message_type: String,
    key: CorrelationKey,
    slot: Arc<Slot<T>>,
    receiver: Option<oneshot::Receiver<Outcome<T>>>,
    timeout: Duration,
}

impl<T: Send + 'static> CorrelatedRequest<T> {
    /// Watch `message_type` for replies matching `key`
    pub fn new<F>(bus: Arc<dyn MessageBus>, message_type: &str, key: CorrelationKey, parse: F) -> Self
    where
        F: Fn(&Message) -> Result<T, String> + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(Slot {
            sender: Mutex::new(Some(sender)),
            registration: HandlerRegistration::reserve(Arc::clone(&bus)),
        });

        let handler_slot = Arc::clone(&slot);
        let handler_key = key.clone();
        let reply_type = message_type.to_string();
        slot.registration.install(Handler::new(
            slot.registration.id(),
            message_type,
            move |message| handler_key.matches(message),
            move |message| {
                let Some(sender) = handler_slot.claim() else {
                    debug!(message_type = %reply_type, "Ignoring reply for resolved request");
                    return;
                };
                let outcome = parse(message).map_err(|reason| RequestError::Parse {
                    message_type: reply_type.clone(),
                    reason,
                });
                let _ = sender.send(outcome);
            },
        ));

        Self {
            bus,
            message_type: message_type.to_string(),
            key,
            slot,
            receiver: Some(receiver),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the reply deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Correlation key
    pub const fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Reply deadline
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the outcome has been decided
    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Whether the reply handler is still on the bus
    pub fn is_listening(&self) -> bool {
        self.slot.registration.is_installed()
    }

    /// Publish the request with the correlation fields stamped in
    ///
    /// A publish failure resolves the request; its handler is removed.
    pub fn send(&self, request_type: &str, mut payload: Payload) -> RequestResult<()> {
        self.key.stamp(&mut payload);
        debug!(
            request_type = %request_type,
            reply_type = %self.message_type,
            username = %self.key.username(),
            "Sending correlated request"
        );
        if let Err(e) = self.bus.publish(request_type, payload) {
            warn!(request_type = %request_type, error = %e, "Failed to publish request");
            drop(self.slot.claim());
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the outcome
    ///
    /// On timeout the handler is removed before the error is returned; a
    /// reply that won the race just before the deadline is still honored.
    pub async fn await_result(mut self) -> RequestResult<T> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(RequestError::Abandoned);
        };

        match tokio::time::timeout(self.timeout, &mut receiver).await {
            Ok(outcome) => outcome.unwrap_or(Err(RequestError::Abandoned)),
            Err(_) => {
                if let Some(sender) = self.slot.claim() {
                    debug!(
                        reply_type = %self.message_type,
                        timeout_ms = self.timeout.as_millis(),
                        "Correlated request timed out"
                    );
                    let _ = sender.send(Err(RequestError::Timeout {
                        message_type: self.message_type.clone(),
                        timeout: self.timeout,
                    }));
                }
                receiver.await.unwrap_or(Err(RequestError::Abandoned))
            }
        }
    }

    /// Publish the request and wait for the outcome
    pub async fn request(self, request_type: &str, payload: Payload) -> RequestResult<T> {
        self.send(request_type, payload)?;
        self.await_result().await
    }
}

impl<T> Drop for CorrelatedRequest<T> {
    fn drop(&mut self) {
        self.slot.registration.remove();
    }
}

impl<T> std::fmt::Debug for CorrelatedRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatedRequest")
            .field("message_type", &self.message_type)
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
