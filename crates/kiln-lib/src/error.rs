//! Error taxonomy for the launcher core.
//!
//! Every public operation returns one of these. Internal filesystem plumbing
//! uses `anyhow` with context and is flattened into the `cause` strings here.

use crate::game::updater::UpdateStep;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no executable found for {game_id} in {install_dir:?}")]
    NoExecutable {
        game_id: String,
        install_dir: PathBuf,
    },

    #[error("executable {0:?} does not exist or is not a file")]
    InvalidExecutable(PathBuf),

    #[error("game {0} is already running")]
    AlreadyRunning(String),

    #[error("game {0} is being updated")]
    Updating(String),

    #[error("game {0} is being uninstalled")]
    Uninstalling(String),

    #[error("invalid game id {0:?}")]
    InvalidGameId(String),

    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("launcher runtime is not available")]
    Unavailable,
}

/// Signal delivery failure. Never fatal: escalation and cleanup still run.
#[derive(Debug, Clone, Error)]
pub enum TerminationError {
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("termination helper failed for pid {pid}: {message}")]
    Helper { pid: u32, message: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("HTTP error {status}: {url}")]
    Http { status: u16, url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("I/O error on {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("download canceled")]
    Canceled,

    #[error("a download for {0} is already queued or active")]
    AlreadyQueued(String),

    #[error("no download found for {0}")]
    NotFound(String),

    #[error("invalid game id {0:?}")]
    InvalidGameId(String),

    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("launcher runtime is not available")]
    Unavailable,
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => Self::Network(err.to_string()),
        }
    }
}

/// A failed update, tagged with the step that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("update failed during {step}: {cause}")]
pub struct UpdateError {
    pub step: UpdateStep,
    pub cause: String,
}

impl UpdateError {
    pub fn new(step: UpdateStep, cause: impl Into<String>) -> Self {
        Self {
            step,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateCheckError {
    #[error("remote version service failed: {0}")]
    Remote(String),

    #[error("invalid response from version service: {0}")]
    InvalidResponse(String),

    #[error("invalid game id {0:?}")]
    InvalidGameId(String),

    #[error("launcher runtime is not available")]
    Unavailable,
}

impl From<reqwest::Error> for UpdateCheckError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Remote(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UninstallError {
    #[error("invalid game id {0:?}")]
    InvalidGameId(String),

    #[error("game {0} is not installed")]
    NotInstalled(String),

    #[error("game {0} is running; stop it before uninstalling")]
    Running(String),

    #[error("game {0} is being updated")]
    Updating(String),

    #[error("game {0} is already being uninstalled")]
    InProgress(String),

    #[error("failed to remove {game_id}: {cause}")]
    Io { game_id: String, cause: String },

    #[error("launcher runtime is not available")]
    Unavailable,
}

/// Stale registry entry found during startup reconciliation. Logged, never
/// surfaced as a failure.
#[derive(Debug, Clone, Error)]
#[error("stale entry for {game_id} (pid {pid}): {reason}")]
pub struct ReconciliationWarning {
    pub game_id: String,
    pub pid: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_error_names_step() {
        let err = UpdateError::new(UpdateStep::Extracting, "invalid zip");
        assert_eq!(
            err.to_string(),
            "update failed during extracting: invalid zip"
        );
    }
}
