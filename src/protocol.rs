// ABOUTME: Typed wire contract for project download and service pool messages
// ABOUTME: Message type names, payload structs and correlation ids

//! Wire contract.
//!
//! Every message travelling over the bus is a JSON object. The structs in
//! this module give each message type a typed shape; [`to_payload`] and
//! [`from_payload`] convert between them and raw [`Payload`]s.
//!
//! | type | direction |
//! |---|---|
//! | `getProjectRequest` / `getProjectResponse` | out / in |
//! | `getResourceRequest` / `getResourceResponse` | out / in |
//! | `startServiceRequest` / `startServiceResponse` | out / in (broadcast) |
//! | `serviceReady` | in (broadcast) |
//! | `shutdownService` | out |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::bus::{Message, Payload};

// === Message Types ===

/// Project listing request
pub const GET_PROJECT_REQUEST: &str = "getProjectRequest";
/// Project listing reply
pub const GET_PROJECT_RESPONSE: &str = "getProjectResponse";
/// Resource content request
pub const GET_RESOURCE_REQUEST: &str = "getResourceRequest";
/// Resource content reply
pub const GET_RESOURCE_RESPONSE: &str = "getResourceResponse";
/// Worker bind request
pub const START_SERVICE_REQUEST: &str = "startServiceRequest";
/// Worker bind confirmation (broadcast)
pub const START_SERVICE_RESPONSE: &str = "startServiceResponse";
/// Worker availability announcement (broadcast)
pub const SERVICE_READY: &str = "serviceReady";
/// Worker shutdown instruction
pub const SHUTDOWN_SERVICE: &str = "shutdownService";

// === Field Names ===

/// Correlation id echoed by repliers
pub const CALLBACK_ID: &str = "callback_id";
/// Requesting user
pub const USERNAME: &str = "username";
/// Pool identifier on worker broadcasts
pub const SERVICE: &str = "service";
/// Worker address
pub const SOCKET_ID: &str = "socketID";

// === Correlation Id ===

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation id chosen by a requester and echoed by the replier.
///
/// Drawn from a process-wide monotonic counter, so two in-flight
/// operations never share one. Serialized as a JSON number; numeric
/// strings are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Allocate a fresh id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a known value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Parse from a JSON number or numeric string
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self),
            Value::String(s) => s.trim().parse().ok().map(Self),
            _ => None,
        }
    }

    /// Convert to the JSON value put on the wire
    pub fn to_value(self) -> Value {
        Value::from(self.0)
    }

    /// Read the `callback_id` field of a message
    pub fn of(message: &Message) -> Option<Self> {
        message.payload.get(CALLBACK_ID).and_then(Self::from_value)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CallbackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for CallbackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid callback id: {value}")))
    }
}

// === Project Download ===

/// Ask a project host for the resource listing of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProjectRequest {
    /// Echoed back in the listing
    pub callback_id: CallbackId,
    /// Requesting user
    pub username: String,
    /// Project to list
    pub project: String,
}

/// Resource listing of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProjectResponse {
    /// Id of the request being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<CallbackId>,
    /// User the listing is for
    pub username: String,
    /// Listed project
    pub project: String,
    /// Folders and files, in any order
    pub files: Vec<ResourceEntry>,
}

/// Kind of a listed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// `type: "folder"`
    Folder,
    /// `type: "file"`
    File,
    /// Anything else (including a missing `type`); ignored by downloads
    Other,
}

/// One entry of a project listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Path relative to the project root; empty for the root itself
    pub path: String,

    /// Modification time, milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Raw `type` field (`folder` or `file`)
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ResourceEntry {
    /// Create a folder entry
    pub fn folder(path: impl Into<String>, timestamp: i64) -> Self {
        Self {
            path: path.into(),
            timestamp,
            kind: "folder".to_string(),
        }
    }

    /// Create a file entry
    pub fn file(path: impl Into<String>, timestamp: i64) -> Self {
        Self {
            path: path.into(),
            timestamp,
            kind: "file".to_string(),
        }
    }

    /// Parsed resource kind
    pub fn resource_kind(&self) -> ResourceKind {
        match self.kind.as_str() {
            "folder" => ResourceKind::Folder,
            "file" => ResourceKind::File,
            _ => ResourceKind::Other,
        }
    }

    /// Whether this entry denotes the project root
    pub fn is_project_root(&self) -> bool {
        self.path.is_empty()
    }
}

/// Ask a project host for one resource's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResourceRequest {
    /// Id of the owning download
    pub callback_id: CallbackId,
    /// Requesting user
    pub username: String,
    /// Project holding the resource
    pub project: String,
    /// Path relative to the project root
    pub resource: String,
}

/// Content of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResourceResponse {
    /// Id of the download being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<CallbackId>,
    /// User the content is for
    pub username: String,
    /// Path relative to the project root
    pub resource: String,
    /// Modification time, milliseconds since the Unix epoch
    pub timestamp: i64,
    /// File content
    pub content: String,
}

// === Service Pool ===

/// Bind a pooled worker to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServiceRequest {
    /// Pool the worker belongs to
    pub service: String,
    /// User to bind
    pub username: String,
    /// Worker to bind
    #[serde(rename = "socketID")]
    pub socket_id: String,
    /// Token the confirmation should echo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<CallbackId>,
}

/// Broadcast confirming a worker is bound to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServiceResponse {
    /// Pool the worker belongs to
    pub service: String,
    /// User now bound
    pub username: String,
    /// Bound worker
    #[serde(rename = "socketID")]
    pub socket_id: String,
    /// Echoed bind token; absent from legacy workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<CallbackId>,
}

/// Broadcast announcing an unbound worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReady {
    /// Pool the worker belongs to
    pub service: String,
    /// Announced worker
    #[serde(rename = "socketID")]
    pub socket_id: String,
}

/// Tell a worker to shut down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownService {
    /// Pool the worker belongs to
    pub service: String,
    /// Worker to stop
    #[serde(rename = "socketID")]
    pub socket_id: String,
}

// === Payload Conversion ===

/// Errors converting between typed messages and payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialized value was not a JSON object
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// Missing or mistyped field
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a typed message as a payload
pub fn to_payload<T: Serialize>(message: &T) -> Result<Payload, ProtocolError> {
    match serde_json::to_value(message)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Decode a payload into a typed message
pub fn from_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(Value::Object(payload.clone()))?)
}
