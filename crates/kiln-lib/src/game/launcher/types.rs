/// Core types for launching and tracking games
use crate::utils::ProcessIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Request to launch a game
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Unique identifier for the game
    pub game_id: String,

    /// Executable to run. Resolved from the install dir when absent.
    pub executable: Option<PathBuf>,

    /// Working directory. Defaults to the executable's directory.
    pub work_dir: Option<PathBuf>,

    /// Extra command-line arguments
    pub args: Vec<String>,
}

impl LaunchRequest {
    pub fn new(game_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            executable: None,
            work_dir: None,
            args: Vec::new(),
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How the registry came to know about a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessOrigin {
    /// Spawned by this launcher session; the child handle is owned
    Spawned,
    /// Rediscovered by pid at startup; supervised by polling
    Adopted,
}

/// Command sent to a process supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorCommand {
    Terminate,
    Kill,
}

/// Handle to a supervised process. Signals go through the supervisor, which
/// owns the child, so a pid is never signalled after it has been reaped.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    control: mpsc::UnboundedSender<SupervisorCommand>,
}

impl ProcessHandle {
    pub(crate) fn new(control: mpsc::UnboundedSender<SupervisorCommand>) -> Self {
        Self { control }
    }

    /// Request graceful termination. `false` if the supervisor has already
    /// finished.
    pub(crate) fn terminate(&self) -> bool {
        self.control.send(SupervisorCommand::Terminate).is_ok()
    }

    /// Request a forced kill of the process tree. `false` if the supervisor
    /// has already finished.
    pub(crate) fn kill(&self) -> bool {
        self.control.send(SupervisorCommand::Kill).is_ok()
    }
}

/// A running game, exclusively owned by the registry
#[derive(Debug, Clone)]
pub struct GameProcess {
    pub game_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Launch counter; tags every asynchronous completion for this process
    pub generation: u64,
    pub origin: ProcessOrigin,
    /// Read right after spawn. `None` if the OS would not tell us.
    pub identity: Option<ProcessIdentity>,
    pub(crate) handle: ProcessHandle,
}

/// Public snapshot of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningGame {
    pub game_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub origin: ProcessOrigin,
}

impl From<&GameProcess> for RunningGame {
    fn from(process: &GameProcess) -> Self {
        Self {
            game_id: process.game_id.clone(),
            pid: process.pid,
            started_at: process.started_at,
            origin: process.origin,
        }
    }
}

/// Persisted mirror of a registry entry, used for reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcessRecord {
    pub game_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Without it a record can never be adopted: the pid alone may belong to
    /// anything by now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ProcessIdentity>,
}

impl From<&GameProcess> for RunningProcessRecord {
    fn from(process: &GameProcess) -> Self {
        Self {
            game_id: process.game_id.clone(),
            pid: process.pid,
            started_at: process.started_at,
            identity: process.identity.clone(),
        }
    }
}

/// Why a supervisor reported its process gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit status collected; `None` when killed by a signal
    Exited(Option<i32>),
    /// Waiting on the child failed; the process is treated as gone
    WaitFailed(String),
    /// An adopted pid stopped answering liveness checks
    Vanished,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    NotRunning,
    Stopped,
}

/// Answer to a window-close request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum CloseDecision {
    Allowed,
    Blocked { running: usize },
}
