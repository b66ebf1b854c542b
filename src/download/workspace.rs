// ABOUTME: Workspace adapter that materializes downloaded projects
//
// The download session only talks to the `Workspace` trait. `FsWorkspace`
// writes projects under a root directory and applies the manifest's
// millisecond timestamps as modification times.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

/// Errors raised while materializing resources
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Path is empty where a resource is required, or escapes the project
    #[error("Invalid resource path: {0:?}")]
    InvalidPath(String),

    /// Timestamp cannot be represented
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Target of a project download.
///
/// Paths are relative to the project root and use `/` separators.
#[cfg_attr(test, mockall::automock)]
pub trait Workspace: Send + Sync {
    /// Create (or open) the project container
    fn ensure_project(&self, project: &str) -> Result<(), WorkspaceError>;

    /// Stamp the project root
    fn set_project_timestamp(&self, project: &str, timestamp: i64) -> Result<(), WorkspaceError>;

    /// Create a folder if absent, then stamp it
    fn ensure_folder(&self, project: &str, path: &str, timestamp: i64) -> Result<(), WorkspaceError>;

    /// Create or overwrite a file, then stamp it
    fn write_file(
        &self,
        project: &str,
        path: &str,
        content: &str,
        timestamp: i64,
    ) -> Result<(), WorkspaceError>;
}

/// Filesystem-backed workspace: `<root>/<project>/<path>`
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    /// Create a workspace rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a project
    pub fn project_dir(&self, project: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = relative_path(project)?;
        if relative.components().count() != 1 {
            return Err(WorkspaceError::InvalidPath(project.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Absolute location of a resource inside a project
    pub fn resource_path(&self, project: &str, path: &str) -> Result<PathBuf, WorkspaceError> {
        Ok(self.project_dir(project)?.join(relative_path(path)?))
    }
}

impl Workspace for FsWorkspace {
    fn ensure_project(&self, project: &str) -> Result<(), WorkspaceError> {
        let dir = self.project_dir(project)?;
        fs::create_dir_all(&dir)?;
        debug!(project = %project, dir = %dir.display(), "Project directory ready");
        Ok(())
    }

    fn set_project_timestamp(&self, project: &str, timestamp: i64) -> Result<(), WorkspaceError> {
        stamp(&self.project_dir(project)?, timestamp)
    }

    fn ensure_folder(&self, project: &str, path: &str, timestamp: i64) -> Result<(), WorkspaceError> {
        let dir = self.resource_path(project, path)?;
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
        }
        stamp(&dir, timestamp)
    }

    fn write_file(
        &self,
        project: &str,
        path: &str,
        content: &str,
        timestamp: i64,
    ) -> Result<(), WorkspaceError> {
        let file = self.resource_path(project, path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, content)?;
        stamp(&file, timestamp)
    }
}

/// Validate a `/`-separated relative path
fn relative_path(path: &str) -> Result<PathBuf, WorkspaceError> {
    let candidate = Path::new(path);
    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(WorkspaceError::InvalidPath(path.to_string())),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(WorkspaceError::InvalidPath(path.to_string()));
    }
    Ok(relative)
}

/// Millisecond epoch timestamp to `SystemTime`
pub fn system_time(timestamp: i64) -> Result<SystemTime, WorkspaceError> {
    let millis = u64::try_from(timestamp).map_err(|_| WorkspaceError::InvalidTimestamp(timestamp))?;
    UNIX_EPOCH
        .checked_add(Duration::from_millis(millis))
        .ok_or(WorkspaceError::InvalidTimestamp(timestamp))
}

fn stamp(path: &Path, timestamp: i64) -> Result<(), WorkspaceError> {
    let modified = system_time(timestamp)?;
    fs::File::open(path)?.set_modified(modified)?;
    Ok(())
}
