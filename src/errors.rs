//! Typed error hierarchy for deckhand.
//!
//! Two enums cover the two failure domains:
//! - `RegistryError`: loading and persisting the registry document
//! - `SupervisorError`: every operation on an app (lifecycle, deploy, schedules)
//!
//! `SupervisorError::kind()` collapses the variants onto the coarse taxonomy
//! that callers branch on.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from reading or writing the persisted registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry document at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Registry I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize registry document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Registry writer has shut down")]
    WriterGone,
}

/// Coarse classification of [`SupervisorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyRunning,
    Busy,
    PathEscape,
    NotDeployed,
    StillRunning,
    InvalidApp,
    ShellFailure,
    Registry,
    Other,
}

/// Errors from operations on a single app.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("App \"{name}\" not found")]
    NotFound { name: String },

    #[error("App \"{name}\" already exists")]
    AlreadyExists { name: String },

    #[error("App \"{name}\" is already running (PID {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("App \"{name}\" is busy with another operation, try again shortly")]
    Busy { name: String },

    #[error("Directory {path} is outside the deployments root {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("Directory {path} exists but is not a git checkout")]
    NotAGitCheckout { path: PathBuf },

    #[error("App directory {directory} does not exist yet, deploy \"{name}\" first")]
    NotDeployed { name: String, directory: PathBuf },

    #[error("App \"{name}\" is still running, stop it first or force the removal")]
    StillRunning { name: String },

    #[error("Invalid app definition: {0}")]
    InvalidApp(String),

    #[error("Command `{command}` failed with exit code {}: {stderr}", describe_code(.code))]
    ShellFailure {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout_secs}s")]
    ShellTimeout { command: String, timeout_secs: u64 },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn not_found(name: impl Into<String>) -> Self {
        SupervisorError::NotFound { name: name.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::NotFound { .. } => ErrorKind::NotFound,
            SupervisorError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            SupervisorError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            SupervisorError::Busy { .. } => ErrorKind::Busy,
            SupervisorError::PathEscape { .. } | SupervisorError::NotAGitCheckout { .. } => {
                ErrorKind::PathEscape
            }
            SupervisorError::NotDeployed { .. } => ErrorKind::NotDeployed,
            SupervisorError::StillRunning { .. } => ErrorKind::StillRunning,
            SupervisorError::InvalidApp(_) => ErrorKind::InvalidApp,
            SupervisorError::ShellFailure { .. }
            | SupervisorError::ShellTimeout { .. }
            | SupervisorError::SpawnFailed { .. } => ErrorKind::ShellFailure,
            SupervisorError::Registry(_) => ErrorKind::Registry,
            SupervisorError::Other(_) => ErrorKind::Other,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

fn describe_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}
