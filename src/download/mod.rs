// ABOUTME: Two-phase project download over the message bus (manifest, then fan-out file fetches)
// ABOUTME: Resolves exactly once when every listed file has arrived or on the first failure

//! Project download.
//!
//! # Flow
//!
//! 1. Open the project in the [`Workspace`] and install two handlers, both
//!    scoped to the session's `callback_id`.
//! 2. Publish `getProjectRequest` (state `AwaitingManifest`).
//! 3. On the manifest: materialize folders (the empty path is the project
//!    root), fix the expected file count once, then publish one
//!    `getResourceRequest` per file (state `AwaitingFiles`). An empty file
//!    list completes immediately.
//! 4. Each file reply is written and bumps the completed count; the reply
//!    that makes it equal to the expected count completes the session.
//!
//! ```text
//! AwaitingManifest ──manifest──▶ AwaitingFiles ──last file──▶ Done
//!        │                            │
//!        └──────── error / timeout ───┴──────────────────────▶ Failed
//! ```
//!
//! `Done` and `Failed` are terminal: the first terminal transition removes
//! both handlers and delivers the outcome; later replies never reach the
//! session.

/// Where downloaded resources land
pub mod workspace;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Handler, HandlerRegistration, Message, MessageBus};
use crate::config::DEFAULT_DOWNLOAD_TIMEOUT;
use crate::protocol::{
    self, CallbackId, GetProjectRequest, GetProjectResponse, GetResourceRequest,
    GetResourceResponse, ProtocolError, ResourceKind, GET_PROJECT_REQUEST, GET_PROJECT_RESPONSE,
    GET_RESOURCE_REQUEST, GET_RESOURCE_RESPONSE,
};

pub use workspace::{FsWorkspace, Workspace, WorkspaceError};

// === Errors ===

/// Terminal failures of a download session
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Session did not complete before its deadline
    #[error("Download of '{project}' timed out after {timeout:?} ({completed}/{expected} files)")]
    Timeout {
        /// Project name
        project: String,
        /// Deadline that elapsed
        timeout: Duration,
        /// Files received
        completed: usize,
        /// Files listed
        expected: usize,
    },

    /// A reply was malformed or addressed to another user
    #[error("Malformed '{message_type}' reply: {reason}")]
    Parse {
        /// Reply type
        message_type: String,
        /// Why it was rejected
        reason: String,
    },

    /// The workspace refused a write
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// A request could not be published
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The session was dropped before completing
    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn parse(message_type: &str, reason: impl ToString) -> Self {
        Self::Parse {
            message_type: message_type.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for downloads
pub type DownloadResult<T> = Result<T, DownloadError>;

// === State ===

/// Position of a session in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Waiting for the resource listing
    AwaitingManifest,
    /// Waiting for file contents
    AwaitingFiles,
    /// Every listed file arrived
    Done,
    /// Terminal failure
    Failed,
}

impl DownloadState {
    /// Whether no further transition can happen
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Summary of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Project name
    pub project: String,
    /// Files written
    pub files: usize,
    /// Folders materialized, the project root included
    pub folders: usize,
}

// === Session ===

/// State shared by the caller and both bus handlers
struct Session {
    project: String,
    username: String,
    callback_id: CallbackId,
    bus: Arc<dyn MessageBus>,
    workspace: Arc<dyn Workspace>,
    state: Mutex<DownloadState>,
    /// Set by the first manifest delivery that gets processed
    manifest_claimed: AtomicBool,
    expected: AtomicUsize,
    completed: AtomicUsize,
    folders: AtomicUsize,
    outstanding: DashSet<String>,
    sender: Mutex<Option<oneshot::Sender<DownloadResult<DownloadOutcome>>>>,
    manifest_handler: HandlerRegistration,
    resource_handler: HandlerRegistration,
}

impl Session {
    fn state(&self) -> DownloadState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless already terminal
    fn advance(&self, next: DownloadState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Terminal transition; only the first call has any effect
    fn finish(&self, outcome: DownloadResult<DownloadOutcome>) -> bool {
        let terminal = if outcome.is_ok() {
            DownloadState::Done
        } else {
            DownloadState::Failed
        };
        if !self.advance(terminal) {
            return false;
        }

        self.manifest_handler.remove();
        self.resource_handler.remove();

        match &outcome {
            Ok(summary) => info!(
                project = %self.project,
                username = %self.username,
                files = summary.files,
                folders = summary.folders,
                "Project download complete"
            ),
            Err(e) => error!(
                project = %self.project,
                username = %self.username,
                error = %e,
                "Project download failed"
            ),
        }

        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(outcome);
        }
        true
    }

    fn summary(&self) -> DownloadOutcome {
        DownloadOutcome {
            project: self.project.clone(),
            files: self.completed.load(Ordering::SeqCst),
            folders: self.folders.load(Ordering::SeqCst),
        }
    }

    fn on_manifest(&self, message: &Message) {
        if self.state() != DownloadState::AwaitingManifest
            || self.manifest_claimed.swap(true, Ordering::AcqRel)
        {
            debug!(project = %self.project, "Ignoring duplicate manifest");
            return;
        }
        if let Err(e) = self.process_manifest(message) {
            self.finish(Err(e));
        }
    }

    fn process_manifest(&self, message: &Message) -> DownloadResult<()> {
        let manifest: GetProjectResponse = protocol::from_payload(&message.payload)
            .map_err(|e: ProtocolError| DownloadError::parse(GET_PROJECT_RESPONSE, e))?;
        if manifest.username != self.username {
            return Err(DownloadError::parse(
                GET_PROJECT_RESPONSE,
                format!("username mismatch: expected '{}', got '{}'", self.username, manifest.username),
            ));
        }

        // Pass 1: folders, and the file count fixed before any fetch goes out
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        for entry in &manifest.files {
            match entry.resource_kind() {
                ResourceKind::Folder if entry.is_project_root() => {
                    self.workspace
                        .set_project_timestamp(&self.project, entry.timestamp)?;
                    self.folders.fetch_add(1, Ordering::SeqCst);
                }
                ResourceKind::Folder => {
                    self.workspace
                        .ensure_folder(&self.project, &entry.path, entry.timestamp)?;
                    self.folders.fetch_add(1, Ordering::SeqCst);
                }
                ResourceKind::File => {
                    if seen.insert(entry.path.clone()) {
                        files.push(entry.path.clone());
                    }
                }
                ResourceKind::Other => {
                    debug!(path = %entry.path, kind = %entry.kind, "Skipping unknown resource type");
                }
            }
        }

        for path in &files {
            self.outstanding.insert(path.clone());
        }
        self.expected.store(files.len(), Ordering::SeqCst);
        debug!(
            project = %self.project,
            files = files.len(),
            folders = self.folders.load(Ordering::SeqCst),
            "Manifest received"
        );

        if files.is_empty() {
            self.finish(Ok(self.summary()));
            return Ok(());
        }
        if !self.advance(DownloadState::AwaitingFiles) {
            return Ok(());
        }

        // Pass 2: fan out
        for path in files {
            let request = GetResourceRequest {
                callback_id: self.callback_id,
                username: self.username.clone(),
                project: manifest.project.clone(),
                resource: path,
            };
            let payload = protocol::to_payload(&request)
                .map_err(|e| DownloadError::parse(GET_RESOURCE_REQUEST, e))?;
            self.bus.publish(GET_RESOURCE_REQUEST, payload)?;
            if self.state().is_terminal() {
                break;
            }
        }
        Ok(())
    }

    fn on_resource(&self, message: &Message) {
        if self.state() != DownloadState::AwaitingFiles {
            debug!(project = %self.project, "Ignoring resource reply outside file phase");
            return;
        }
        if let Err(e) = self.process_resource(message) {
            self.finish(Err(e));
        }
    }

    fn process_resource(&self, message: &Message) -> DownloadResult<()> {
        let reply: GetResourceResponse = protocol::from_payload(&message.payload)
            .map_err(|e: ProtocolError| DownloadError::parse(GET_RESOURCE_RESPONSE, e))?;
        if reply.username != self.username {
            return Err(DownloadError::parse(
                GET_RESOURCE_RESPONSE,
                format!("username mismatch: expected '{}', got '{}'", self.username, reply.username),
            ));
        }
        if self.outstanding.remove(&reply.resource).is_none() {
            warn!(
                project = %self.project,
                resource = %reply.resource,
                "Ignoring reply for a resource that is not outstanding"
            );
            return Ok(());
        }

        self.workspace
            .write_file(&self.project, &reply.resource, &reply.content, reply.timestamp)?;

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = self.expected.load(Ordering::SeqCst);
        debug!(
            project = %self.project,
            resource = %reply.resource,
            completed,
            expected,
            "Resource downloaded"
        );
        if completed == expected {
            self.finish(Ok(self.summary()));
        }
        Ok(())
    }
}

/// Read-only view of a running session
#[derive(Clone)]
pub struct DownloadMonitor {
    session: Arc<Session>,
}

impl DownloadMonitor {
    /// Current state
    pub fn state(&self) -> DownloadState {
        self.session.state()
    }

    /// `(completed, expected)` file counts
    pub fn progress(&self) -> (usize, usize) {
        (
            self.session.completed.load(Ordering::SeqCst),
            self.session.expected.load(Ordering::SeqCst),
        )
    }
}

impl std::fmt::Debug for DownloadMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadMonitor")
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

// === Download ===

/// One download session for one project and user.
///
/// Call [`ProjectDownload::run`] to drive it to a terminal outcome. A
/// session is single-use; restart by creating a new one.
pub struct ProjectDownload {
    session: Arc<Session>,
    receiver: Option<oneshot::Receiver<DownloadResult<DownloadOutcome>>>,
    timeout: Duration,
}

impl ProjectDownload {
    /// Prepare a download of `project` for `username`
    pub fn new(
        bus: Arc<dyn MessageBus>,
        workspace: Arc<dyn Workspace>,
        project: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        let session = Arc::new(Session {
            project: project.into(),
            username: username.into(),
            callback_id: CallbackId::next(),
            manifest_handler: HandlerRegistration::reserve(Arc::clone(&bus)),
            resource_handler: HandlerRegistration::reserve(Arc::clone(&bus)),
            bus,
            workspace,
            state: Mutex::new(DownloadState::AwaitingManifest),
            manifest_claimed: AtomicBool::new(false),
            expected: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            folders: AtomicUsize::new(0),
            outstanding: DashSet::new(),
            sender: Mutex::new(Some(sender)),
        });

        Self {
            session,
            receiver: Some(receiver),
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Override the session deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Correlation id used by both handlers
    pub fn callback_id(&self) -> CallbackId {
        self.session.callback_id
    }

    /// Current state
    pub fn state(&self) -> DownloadState {
        self.session.state()
    }

    /// `(completed, expected)` file counts
    pub fn progress(&self) -> (usize, usize) {
        (
            self.session.completed.load(Ordering::SeqCst),
            self.session.expected.load(Ordering::SeqCst),
        )
    }

    /// Handle for observing state and progress
    pub fn monitor(&self) -> DownloadMonitor {
        DownloadMonitor {
            session: Arc::clone(&self.session),
        }
    }

    fn install_handlers(&self) {
        let callback_id = self.session.callback_id;

        let session = Arc::clone(&self.session);
        self.session.manifest_handler.install(Handler::new(
            self.session.manifest_handler.id(),
            GET_PROJECT_RESPONSE,
            move |message| CallbackId::of(message) == Some(callback_id),
            move |message| session.on_manifest(message),
        ));

        let session = Arc::clone(&self.session);
        self.session.resource_handler.install(Handler::new(
            self.session.resource_handler.id(),
            GET_RESOURCE_RESPONSE,
            move |message| CallbackId::of(message) == Some(callback_id),
            move |message| session.on_resource(message),
        ));
    }

    fn start(&self) -> DownloadResult<()> {
        let session = &self.session;
        session.workspace.ensure_project(&session.project)?;

        self.install_handlers();

        let request = GetProjectRequest {
            callback_id: session.callback_id,
            username: session.username.clone(),
            project: session.project.clone(),
        };
        let payload = protocol::to_payload(&request)
            .map_err(|e| DownloadError::parse(GET_PROJECT_REQUEST, e))?;

        info!(
            project = %session.project,
            username = %session.username,
            callback_id = %session.callback_id,
            "Requesting project manifest"
        );
        session.bus.publish(GET_PROJECT_REQUEST, payload)?;
        Ok(())
    }

    /// Run the session to its terminal outcome
    pub async fn run(mut self) -> DownloadResult<DownloadOutcome> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(DownloadError::Cancelled);
        };

        if let Err(e) = self.start() {
            self.session.finish(Err(e));
        }

        match tokio::time::timeout(self.timeout, &mut receiver).await {
            Ok(outcome) => outcome.unwrap_or(Err(DownloadError::Cancelled)),
            Err(_) => {
                let (completed, expected) = self.progress();
                self.session.finish(Err(DownloadError::Timeout {
                    project: self.session.project.clone(),
                    timeout: self.timeout,
                    completed,
                    expected,
                }));
                receiver.await.unwrap_or(Err(DownloadError::Cancelled))
            }
        }
    }
}

impl Drop for ProjectDownload {
    fn drop(&mut self) {
        self.session.finish(Err(DownloadError::Cancelled));
    }
}

impl std::fmt::Debug for ProjectDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectDownload")
            .field("project", &self.session.project)
            .field("username", &self.session.username)
            .field("callback_id", &self.session.callback_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
