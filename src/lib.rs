// ABOUTME: Library crate for busline exposing the bus coordination engine
// ABOUTME: Correlated requests, multi-phase project downloads and a warm worker pool

//! Request correlation, fan-out project downloads and a warm worker pool
//! on top of a publish/subscribe message bus.

/// Bus abstraction, scoped handler registration and the in-memory bus
pub mod bus;
/// Timeouts and pool tunables, loaded from TOML
pub mod config;
/// Manifest-then-files project download
pub mod download;
/// Warm worker pool bound to users on demand
pub mod pool;
/// Wire messages exchanged over the bus
pub mod protocol;
/// Single request/reply correlated by user and callback id
pub mod request;

pub use bus::{Handler, HandlerId, HandlerRegistration, InMemoryBus, Message, MessageBus, Payload};
pub use config::Config;
pub use download::{DownloadError, DownloadOutcome, DownloadState, FsWorkspace, ProjectDownload, Workspace};
pub use pool::{PoolError, PoolStats, ServicePool, ServiceProvisioner};
pub use protocol::CallbackId;
pub use request::{CorrelatedRequest, CorrelationKey, RequestError};
