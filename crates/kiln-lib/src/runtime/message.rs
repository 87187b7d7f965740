//! Everything the runtime task reacts to: client requests carrying a reply
//! channel, and completions posted by the tasks the runtime spawned.
//!
//! Completions are tagged with the generation, transfer id or job id they
//! belong to, so late arrivals from a finished launch, transfer or update are
//! recognized and dropped.

use crate::error::{DownloadError, LaunchError, TerminationError, UninstallError, UpdateError};
use crate::game::installer::{DownloadOutcome, DownloadRequest, DownloadTask};
use crate::game::launcher::{CloseDecision, ExitReason, LaunchRequest, RunningGame, StopOutcome};
use crate::game::playtime::PlaytimeTotal;
use crate::game::updater::{UpdateOutcome, UpdateRun, UpdateStatus, UpdateStep};
use crate::utils::Liveness;
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Message {
    // Requests
    Launch {
        request: LaunchRequest,
        reply: Reply<Result<RunningGame, LaunchError>>,
    },
    Stop {
        game_id: String,
        reply: Reply<StopOutcome>,
    },
    IsRunning {
        game_id: String,
        reply: Reply<bool>,
    },
    ListRunning {
        reply: Reply<Vec<RunningGame>>,
    },
    Playtime {
        game_id: String,
        reply: Reply<PlaytimeTotal>,
    },
    RequestClose {
        reply: Reply<CloseDecision>,
    },
    Enqueue {
        request: DownloadRequest,
        reply: Reply<Result<DownloadTask, DownloadError>>,
        /// Resolved with the final outcome once the download settles
        completion: Option<Reply<DownloadOutcome>>,
    },
    CancelDownload {
        game_id: String,
        reply: Reply<bool>,
    },
    PauseDownload {
        game_id: String,
        reply: Reply<bool>,
    },
    ResumeDownload {
        game_id: String,
        reply: Reply<bool>,
    },
    ClearDownload {
        game_id: String,
        reply: Reply<bool>,
    },
    ListDownloads {
        reply: Reply<Vec<DownloadTask>>,
    },
    WaitDownload {
        game_id: String,
        reply: Reply<DownloadOutcome>,
    },
    RunUpdate {
        game_id: String,
        reply: Reply<UpdateRun>,
    },
    QueryUpdate {
        game_id: String,
        reply: Reply<UpdateStatus>,
    },
    WaitUpdate {
        game_id: String,
        reply: Reply<UpdateStatus>,
    },
    Uninstall {
        game_id: String,
        reply: Reply<Result<(), UninstallError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },

    // Completions
    ProcessExited {
        game_id: String,
        generation: u64,
        reason: ExitReason,
    },
    WatchdogFired {
        game_id: String,
        generation: u64,
        liveness: Liveness,
    },
    ForceKillFinished {
        game_id: String,
        generation: u64,
        result: Result<usize, TerminationError>,
    },
    TransferProgress {
        game_id: String,
        transfer_id: u64,
        transferred: u64,
        total: Option<u64>,
    },
    TransferFinished {
        game_id: String,
        transfer_id: u64,
        result: Result<u64, DownloadError>,
    },
    UpdateStepReached {
        game_id: String,
        job_id: u64,
        step: UpdateStep,
        to_version: Option<String>,
    },
    /// Asked by an update right before it swaps files. Answered `true` once
    /// the job is marked applying, `false` if the game is running.
    ApplyGate {
        game_id: String,
        job_id: u64,
        reply: Reply<bool>,
    },
    UpdateFinished {
        game_id: String,
        job_id: u64,
        result: Result<UpdateOutcome, UpdateError>,
    },
    UpdateAborted {
        game_id: String,
        job_id: u64,
        reason: String,
    },
    /// `Ok(false)` when there was no install dir to remove
    UninstallFinished {
        game_id: String,
        result: Result<bool, String>,
        reply: Reply<Result<(), UninstallError>>,
    },
}
