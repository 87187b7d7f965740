//! All launcher state, and the handlers that mutate it.
//!
//! [`LauncherState`] is owned by the runtime task and only ever touched from
//! [`LauncherState::handle`], one message at a time.

use crate::config::LauncherConfig;
use crate::error::{DownloadError, LaunchError, UninstallError, UpdateError};
use crate::game::installer::{
    Admission, DownloadCoordinator, DownloadOutcome, DownloadRequest, DownloadTask, ProgressFn,
    TransferControl, Transport,
};
use crate::game::launcher::process::{
    spawn_game, supervise_adopted, supervise_child, validate_executable,
};
use crate::game::launcher::registry::{load_records, reconcile_records};
use crate::game::launcher::termination::{TerminationController, WatchdogAction};
use crate::game::launcher::types::ProcessHandle;
use crate::game::launcher::{
    CloseDecision, ExecutableResolver, GameProcess, LaunchRequest, ProcessControl, ProcessOrigin,
    ProcessRegistry, RunningGame, RunningProcessRecord, StopOutcome,
};
use crate::game::library::is_valid_game_id;
use crate::game::playtime::PlaytimeTracker;
use crate::game::updater::{
    spawn_update, InstallSwap, RemoteVersionService, UpdateContext, UpdateOrchestrator,
    UpdateOutcome, UpdateRun, UpdateStatus, UpdateStep,
};
use crate::notify::{CoreEvent, EventNotifier};
use crate::runtime::message::{Message, Reply};
use crate::settings::SettingsStore;
use crate::utils::{Liveness, ProcessIdentity};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Collaborators the runtime calls out to
#[derive(Clone)]
pub(crate) struct Services {
    pub settings: Arc<dyn SettingsStore>,
    pub control: Arc<dyn ProcessControl>,
    pub resolver: Arc<dyn ExecutableResolver>,
    pub transport: Arc<dyn Transport>,
    pub versions: Arc<dyn RemoteVersionService>,
}

pub(crate) struct LauncherState {
    config: LauncherConfig,
    services: Services,
    notifier: EventNotifier,
    /// Handed to every task the runtime spawns, so completions come back here
    tx: mpsc::UnboundedSender<Message>,

    registry: ProcessRegistry,
    terminations: TerminationController,
    playtime: PlaytimeTracker,
    downloads: DownloadCoordinator,
    updates: UpdateOrchestrator,
    /// Games whose install dir is being removed; launches and updates wait
    uninstalling: HashSet<String>,

    next_generation: u64,
    stop_waiters: HashMap<String, Vec<Reply<StopOutcome>>>,
    shutdown_waiters: Vec<Reply<()>>,
    shutting_down: bool,
    finished: bool,
}

impl LauncherState {
    pub fn new(
        config: LauncherConfig,
        services: Services,
        notifier: EventNotifier,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let registry = ProcessRegistry::new(config.state_file.clone());
        let terminations = TerminationController::new(
            config.watchdog_timeout,
            config.liveness_recheck_limit,
            services.control.clone(),
        );
        let playtime = PlaytimeTracker::new(services.settings.clone());
        let downloads = DownloadCoordinator::new(
            services.settings.max_concurrent_downloads(),
            config.progress_interval,
        );

        Self {
            config,
            services,
            notifier,
            tx,
            registry,
            terminations,
            playtime,
            downloads,
            updates: UpdateOrchestrator::new(),
            uninstalling: HashSet::new(),
            next_generation: 0,
            stop_waiters: HashMap::new(),
            shutdown_waiters: Vec::new(),
            shutting_down: false,
            finished: false,
        }
    }

    /// Shutdown has completed; the runtime task can exit
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle(&mut self, message: Message) {
        match message {
            Message::Launch { request, reply } => {
                let result = self.launch(request);
                let _ = reply.send(result);
            }
            Message::Stop { game_id, reply } => self.stop(game_id, reply),
            Message::IsRunning { game_id, reply } => {
                let _ = reply.send(self.registry.is_running(&game_id));
            }
            Message::ListRunning { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Message::Playtime { game_id, reply } => {
                let _ = reply.send(self.playtime.total(&game_id));
            }
            Message::RequestClose { reply } => {
                let _ = reply.send(self.request_close());
            }

            Message::Enqueue {
                request,
                reply,
                completion,
            } => self.enqueue(request, reply, completion),
            Message::CancelDownload { game_id, reply } => {
                let (canceled, admissions) = self.downloads.cancel(&game_id);
                self.start_transfers(admissions);
                self.flush_download_events();
                let _ = reply.send(canceled);
            }
            Message::PauseDownload { game_id, reply } => {
                let paused = self.downloads.pause(&game_id);
                self.flush_download_events();
                let _ = reply.send(paused);
            }
            Message::ResumeDownload { game_id, reply } => {
                let resumed = self.downloads.resume(&game_id);
                self.flush_download_events();
                let _ = reply.send(resumed);
            }
            Message::ClearDownload { game_id, reply } => {
                let _ = reply.send(self.downloads.clear(&game_id));
            }
            Message::ListDownloads { reply } => {
                let _ = reply.send(self.downloads.snapshot());
            }
            Message::WaitDownload { game_id, reply } => self.downloads.wait_for(&game_id, reply),

            Message::RunUpdate { game_id, reply } => {
                let run = self.run_update(game_id);
                let _ = reply.send(run);
            }
            Message::QueryUpdate { game_id, reply } => {
                let _ = reply.send(self.updates.status(&game_id));
            }
            Message::WaitUpdate { game_id, reply } => self.updates.wait_for(&game_id, reply),

            Message::Uninstall { game_id, reply } => self.uninstall(game_id, reply),

            Message::Shutdown { reply } => self.shutdown(reply),

            Message::ProcessExited {
                game_id,
                generation,
                reason,
            } => {
                log::debug!(
                    "[runtime] {} (generation {}) exited: {:?}",
                    game_id,
                    generation,
                    reason
                );
                self.finalize(&game_id, generation);
            }
            Message::WatchdogFired {
                game_id,
                generation,
                liveness,
            } => self.on_watchdog(&game_id, generation, liveness),
            Message::ForceKillFinished {
                game_id,
                generation,
                result,
            } => {
                match result {
                    Ok(descendants) => log::info!(
                        "[stop] force killed {} and {} descendant processes",
                        game_id,
                        descendants
                    ),
                    Err(e) => log::warn!("[stop] forced kill of {} reported: {}", game_id, e),
                }
                self.finalize(&game_id, generation);
            }

            Message::TransferProgress {
                game_id,
                transfer_id,
                transferred,
                total,
            } => {
                self.downloads
                    .progress(&game_id, transfer_id, transferred, total);
                self.flush_download_events();
            }
            Message::TransferFinished {
                game_id,
                transfer_id,
                result,
            } => {
                let admissions = self.downloads.finish(&game_id, transfer_id, result);
                self.start_transfers(admissions);
                self.flush_download_events();
            }

            Message::UpdateStepReached {
                game_id,
                job_id,
                step,
                to_version,
            } => {
                if self.updates.advance(&game_id, job_id, step, to_version) {
                    self.notifier.emit(CoreEvent::UpdateStep { game_id, step });
                }
            }
            Message::ApplyGate {
                game_id,
                job_id,
                reply,
            } => {
                let open = self.open_apply_gate(&game_id, job_id);
                let _ = reply.send(open);
            }
            Message::UpdateFinished {
                game_id,
                job_id,
                result,
            } => self.finish_update(&game_id, job_id, result),
            Message::UpdateAborted {
                game_id,
                job_id,
                reason,
            } => {
                let step = self
                    .updates
                    .current_step(&game_id, job_id)
                    .unwrap_or(UpdateStep::Checking);
                self.finish_update(&game_id, job_id, Err(UpdateError::new(step, reason)));
            }

            Message::UninstallFinished {
                game_id,
                result,
                reply,
            } => {
                let result = self.finish_uninstall(&game_id, result);
                let _ = reply.send(result);
            }
        }
    }

    // Launching

    fn launch(&mut self, request: LaunchRequest) -> Result<RunningGame, LaunchError> {
        let game_id = request.game_id.clone();
        let result = self.try_launch(request);
        if let Err(e) = &result {
            log::error!("[launch] {} failed: {}", game_id, e);
            self.notifier
                .push("Launch failed", &format!("Could not start {}: {}", game_id, e));
        }
        result
    }

    fn try_launch(&mut self, request: LaunchRequest) -> Result<RunningGame, LaunchError> {
        if self.shutting_down {
            return Err(LaunchError::Unavailable);
        }
        if !is_valid_game_id(&request.game_id) {
            return Err(LaunchError::InvalidGameId(request.game_id));
        }
        if self.registry.is_running(&request.game_id) {
            return Err(LaunchError::AlreadyRunning(request.game_id));
        }
        if self.updates.is_applying(&request.game_id) {
            return Err(LaunchError::Updating(request.game_id));
        }
        if self.uninstalling.contains(&request.game_id) {
            return Err(LaunchError::Uninstalling(request.game_id));
        }

        let executable = match &request.executable {
            Some(path) => path.clone(),
            None => {
                let install_dir = self.services.settings.install_root().join(&request.game_id);
                self.services
                    .resolver
                    .resolve(&install_dir, &request.game_id)
                    .ok_or_else(|| LaunchError::NoExecutable {
                        game_id: request.game_id.clone(),
                        install_dir,
                    })?
            }
        };
        let executable = validate_executable(&executable)?;

        log::info!("[launch] starting {} from {:?}", request.game_id, executable);
        let (pid, child) = spawn_game(&executable, request.work_dir.as_deref(), &request.args)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let identity = self.services.control.identify(pid);
        if identity.is_none() {
            log::warn!(
                "[launch] could not read identity of {} (PID {}); it will not be re-adopted",
                request.game_id,
                pid
            );
        }
        let process = self.track(
            &request.game_id,
            pid,
            Utc::now(),
            identity,
            ProcessOrigin::Spawned,
            ProcessHandle::new(commands_tx),
        );
        tokio::spawn(supervise_child(
            process.game_id.clone(),
            process.generation,
            pid,
            child,
            commands_rx,
            self.services.control.clone(),
            self.tx.clone(),
        ));

        Ok(RunningGame::from(&process))
    }

    /// Register a process, open its playtime session and announce it.
    /// The caller has checked that the game id is free.
    pub(crate) fn track(
        &mut self,
        game_id: &str,
        pid: u32,
        started_at: DateTime<Utc>,
        identity: Option<ProcessIdentity>,
        origin: ProcessOrigin,
        handle: ProcessHandle,
    ) -> GameProcess {
        self.next_generation += 1;
        let process = GameProcess {
            game_id: game_id.to_string(),
            pid,
            started_at,
            generation: self.next_generation,
            origin,
            identity,
            handle,
        };

        if let Err(existing) = self.registry.insert(process.clone()) {
            log::error!("[runtime] {} was registered twice (PID {})", game_id, existing.pid);
        }
        self.playtime.start(game_id);
        self.notifier.emit(CoreEvent::GameStarted {
            game_id: game_id.to_string(),
        });
        process
    }

    /// Adopt games recorded by an earlier session that are still alive
    pub fn reconcile(&mut self) {
        let Some(path) = self.config.state_file.clone() else {
            return;
        };

        let records = match load_records(&path) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("[reconcile] ignoring unreadable state file {:?}: {:#}", path, e);
                Vec::new()
            }
        };
        if records.is_empty() {
            return;
        }

        let control = self.services.control.clone();
        let (survivors, warnings) = reconcile_records(
            records,
            |pid| control.liveness(pid),
            |pid| control.identify(pid),
        );
        for warning in &warnings {
            log::warn!("[reconcile] {}", warning);
        }
        for record in survivors {
            self.adopt(record);
        }
        self.registry.persist();
    }

    fn adopt(&mut self, record: RunningProcessRecord) {
        // Reconciliation only lets identified records through
        let Some(identity) = record.identity.clone() else {
            return;
        };
        log::info!("[reconcile] adopting {} (PID {})", record.game_id, record.pid);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let process = self.track(
            &record.game_id,
            record.pid,
            record.started_at,
            Some(identity.clone()),
            ProcessOrigin::Adopted,
            ProcessHandle::new(commands_tx),
        );
        tokio::spawn(supervise_adopted(
            process.game_id,
            process.generation,
            process.pid,
            identity,
            self.config.adopted_poll_interval,
            commands_rx,
            self.services.control.clone(),
            self.tx.clone(),
        ));
    }

    // Stopping

    fn stop(&mut self, game_id: String, reply: Reply<StopOutcome>) {
        let Some(process) = self.registry.get(&game_id).cloned() else {
            let _ = reply.send(StopOutcome::NotRunning);
            return;
        };
        self.stop_waiters.entry(game_id.clone()).or_default().push(reply);
        if self.terminations.is_stopping(&game_id) {
            log::debug!("[stop] {} is already stopping, waiting for it", game_id);
            return;
        }
        self.terminations.begin(&process, &self.tx);
    }

    fn on_watchdog(&mut self, game_id: &str, generation: u64, liveness: Liveness) {
        match self
            .terminations
            .on_watchdog(game_id, generation, liveness, &self.tx)
        {
            WatchdogAction::Finalize => self.finalize(game_id, generation),
            WatchdogAction::Escalate => {
                let process = self
                    .registry
                    .get(game_id)
                    .filter(|p| p.generation == generation);
                if let Some(process) = process {
                    if !process.handle.kill() {
                        // The supervisor is gone and its exit report is queued
                        log::debug!("[stop] {} already exited, skipping kill", game_id);
                    }
                }
            }
            WatchdogAction::Recheck | WatchdogAction::Ignore => {}
        }
    }

    /// Tear down a launch exactly once. Whichever completion arrives second
    /// finds the generation gone and does nothing.
    fn finalize(&mut self, game_id: &str, generation: u64) {
        let Some(process) = self.registry.remove_generation(game_id, generation) else {
            log::debug!("[runtime] {} generation {} already finalized", game_id, generation);
            return;
        };

        self.terminations.complete(game_id, generation);
        self.playtime.stop(game_id);
        self.notifier.emit(CoreEvent::GameStopped {
            game_id: game_id.to_string(),
        });
        log::info!("[runtime] {} (PID {}) stopped", game_id, process.pid);

        if let Some(waiters) = self.stop_waiters.remove(game_id) {
            for waiter in waiters {
                let _ = waiter.send(StopOutcome::Stopped);
            }
        }
        self.check_shutdown();
    }

    fn request_close(&self) -> CloseDecision {
        let running = self.registry.len();
        if running == 0 {
            return CloseDecision::Allowed;
        }
        self.notifier.push(
            "Cannot close launcher",
            "Please stop all running games before closing the launcher.",
        );
        CloseDecision::Blocked { running }
    }

    fn shutdown(&mut self, reply: Reply<()>) {
        self.shutdown_waiters.push(reply);
        if !self.shutting_down {
            self.shutting_down = true;
            log::info!(
                "[runtime] shutting down: {} running games, {} active downloads",
                self.registry.len(),
                self.downloads.active_count()
            );

            self.downloads.cancel_all();
            self.flush_download_events();

            for game_id in self.registry.game_ids() {
                if self.terminations.is_stopping(&game_id) {
                    continue;
                }
                if let Some(process) = self.registry.get(&game_id).cloned() {
                    self.terminations.begin(&process, &self.tx);
                }
            }
        }
        self.check_shutdown();
    }

    fn check_shutdown(&mut self) {
        if !self.shutting_down || !self.registry.is_empty() {
            return;
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.finished = true;
    }

    // Downloads

    fn enqueue(
        &mut self,
        request: DownloadRequest,
        reply: Reply<Result<DownloadTask, DownloadError>>,
        completion: Option<Reply<DownloadOutcome>>,
    ) {
        let result = if self.shutting_down {
            Err(DownloadError::Unavailable)
        } else {
            self.downloads.enqueue(request)
        };

        match result {
            Ok((task, admissions)) => {
                if let Some(completion) = completion {
                    self.downloads.wait_for(&task.game_id, completion);
                }
                self.start_transfers(admissions);
                self.flush_download_events();
                let _ = reply.send(Ok(task));
            }
            Err(e) => {
                if let Some(completion) = completion {
                    let _ = completion.send(Err(e.clone()));
                }
                let _ = reply.send(Err(e));
            }
        }
    }

    fn start_transfers(&self, admissions: Vec<Admission>) {
        for admission in admissions {
            self.start_transfer(admission);
        }
    }

    /// Run one transfer on its own task. Progress and the final result come
    /// back as messages; a panicking transport is reported as interrupted.
    fn start_transfer(&self, admission: Admission) {
        let game_id = admission.request.game_id.clone();
        let transfer_id = admission.transfer_id;
        log::info!("[download] starting {} (transfer {})", game_id, transfer_id);

        let progress_tx = self.tx.clone();
        let progress_id = game_id.clone();
        let progress: ProgressFn = Arc::new(move |transferred: u64, total: Option<u64>| {
            let _ = progress_tx.send(Message::TransferProgress {
                game_id: progress_id.clone(),
                transfer_id,
                transferred,
                total,
            });
        });
        let control =
            TransferControl::new(transfer_id, admission.cancel, admission.pause, progress);

        let request = admission.request;
        let transport = self.services.transport.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(transport.fetch(&request, control))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    log::error!("[download] transfer for {} panicked", game_id);
                    Err(DownloadError::Interrupted("transfer task panicked".to_string()))
                });
            let _ = tx.send(Message::TransferFinished {
                game_id,
                transfer_id,
                result,
            });
        });
    }

    fn flush_download_events(&mut self) {
        for event in self.downloads.drain_events() {
            self.notifier.emit(event);
        }
    }

    // Uninstalling

    fn uninstall(&mut self, game_id: String, reply: Reply<Result<(), UninstallError>>) {
        if let Err(e) = self.check_uninstall(&game_id) {
            log::warn!("[uninstall] refusing {}: {}", game_id, e);
            let _ = reply.send(Err(e));
            return;
        }

        log::info!("[uninstall] removing {}", game_id);
        self.uninstalling.insert(game_id.clone());
        let swap = InstallSwap::new(&game_id, &self.services.settings.install_root());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || swap.remove()).await {
                Ok(removed) => removed.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Message::UninstallFinished {
                game_id,
                result,
                reply,
            });
        });
    }

    fn check_uninstall(&self, game_id: &str) -> Result<(), UninstallError> {
        if self.shutting_down {
            return Err(UninstallError::Unavailable);
        }
        if !is_valid_game_id(game_id) {
            return Err(UninstallError::InvalidGameId(game_id.to_string()));
        }
        if self.registry.is_running(game_id) {
            return Err(UninstallError::Running(game_id.to_string()));
        }
        if self.updates.has_job(game_id) {
            return Err(UninstallError::Updating(game_id.to_string()));
        }
        if self.uninstalling.contains(game_id) {
            return Err(UninstallError::InProgress(game_id.to_string()));
        }
        Ok(())
    }

    fn finish_uninstall(
        &mut self,
        game_id: &str,
        removed: Result<bool, String>,
    ) -> Result<(), UninstallError> {
        self.uninstalling.remove(game_id);
        let settings = &self.services.settings;

        let removed = match removed {
            Ok(removed) => removed,
            Err(cause) => {
                log::error!("[uninstall] {} failed: {}", game_id, cause);
                self.notifier
                    .push("Uninstall failed", &format!("{}: {}", game_id, cause));
                return Err(UninstallError::Io {
                    game_id: game_id.to_string(),
                    cause,
                });
            }
        };
        if !removed && settings.installed_version(game_id).is_none() {
            return Err(UninstallError::NotInstalled(game_id.to_string()));
        }

        if let Err(e) = settings.clear_installed_version(game_id) {
            log::warn!(
                "[uninstall] failed to clear installed version of {}: {:#}",
                game_id,
                e
            );
        }
        log::info!("[uninstall] {} removed", game_id);
        self.notifier.emit(CoreEvent::GameUninstalled {
            game_id: game_id.to_string(),
        });
        self.notifier
            .push("Game uninstalled", &format!("{} was removed", game_id));
        Ok(())
    }

    // Updates

    fn run_update(&mut self, game_id: String) -> UpdateRun {
        if self.shutting_down || self.uninstalling.contains(&game_id) {
            return UpdateRun::Rejected(self.updates.status(&game_id));
        }

        let installed = self.services.settings.installed_version(&game_id);
        match self.updates.try_begin(&game_id, installed) {
            Ok((job_id, status)) => {
                log::info!("[update:{}] job {} started", game_id, job_id);
                self.notifier.emit(CoreEvent::UpdateStep {
                    game_id: game_id.clone(),
                    step: UpdateStep::Checking,
                });
                let ctx = UpdateContext {
                    tx: self.tx.clone(),
                    versions: self.services.versions.clone(),
                    settings: self.services.settings.clone(),
                };
                spawn_update(ctx, game_id, job_id);
                UpdateRun::Started(status)
            }
            Err(status) => {
                log::info!("[update:{}] already in flight, not starting another", game_id);
                UpdateRun::Rejected(status)
            }
        }
    }

    /// Files may only be swapped while the game is not running. Once this
    /// returns `true`, launches of the game are refused until the job ends.
    fn open_apply_gate(&mut self, game_id: &str, job_id: u64) -> bool {
        if !self.updates.is_current(game_id, job_id) {
            return false;
        }
        if self.registry.is_running(game_id) {
            log::warn!("[update:{}] game is running, refusing to apply", game_id);
            return false;
        }
        self.updates
            .advance(game_id, job_id, UpdateStep::Applying, None);
        self.notifier.emit(CoreEvent::UpdateStep {
            game_id: game_id.to_string(),
            step: UpdateStep::Applying,
        });
        true
    }

    fn finish_update(
        &mut self,
        game_id: &str,
        job_id: u64,
        result: Result<UpdateOutcome, UpdateError>,
    ) {
        let Some(status) = self.updates.finish(game_id, job_id, result) else {
            log::debug!("[update:{}] ignoring result of stale job {}", game_id, job_id);
            return;
        };

        match status {
            UpdateStatus::Done { version } => {
                log::info!("[update:{}] installed {}", game_id, version);
                self.notifier.emit(CoreEvent::UpdateStep {
                    game_id: game_id.to_string(),
                    step: UpdateStep::Done,
                });
                self.notifier.push(
                    "Update installed",
                    &format!("{} was updated to version {}", game_id, version),
                );
            }
            UpdateStatus::UpToDate { .. } => {
                self.notifier.emit(CoreEvent::UpdateStep {
                    game_id: game_id.to_string(),
                    step: UpdateStep::Done,
                });
            }
            UpdateStatus::Failed { step, cause } => {
                log::error!("[update:{}] failed during {}: {}", game_id, step, cause);
                self.notifier.emit(CoreEvent::UpdateStep {
                    game_id: game_id.to_string(),
                    step: UpdateStep::Failed,
                });
                self.notifier.emit(CoreEvent::UpdateFailed {
                    game_id: game_id.to_string(),
                    reason: format!("{} failed: {}", step, cause),
                });
                self.notifier
                    .push("Update failed", &format!("{}: {}", game_id, cause));
            }
            UpdateStatus::Idle | UpdateStatus::InProgress { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TerminationError, UpdateCheckError};
    use crate::game::launcher::types::SupervisorCommand;
    use crate::game::launcher::{ExitReason, PreferredExecutableResolver};
    use crate::game::updater::RemoteRelease;
    use crate::notify::UiMessage;
    use crate::settings::{JsonSettingsStore, LauncherSettings};
    use futures::future::BoxFuture;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Liveness answers from a fixed table; unknown pids are dead
    struct TableControl(HashMap<u32, Liveness>);

    /// Every live pid in the table started at `pid` seconds
    fn identity(pid: u32) -> ProcessIdentity {
        ProcessIdentity {
            start_time: u64::from(pid),
            executable: None,
        }
    }

    impl ProcessControl for TableControl {
        fn liveness(&self, pid: u32) -> Liveness {
            self.0.get(&pid).copied().unwrap_or(Liveness::Dead)
        }

        fn identify(&self, pid: u32) -> Option<ProcessIdentity> {
            self.0.contains_key(&pid).then(|| identity(pid))
        }

        fn terminate(&self, _pid: u32) -> BoxFuture<'_, Result<(), TerminationError>> {
            Box::pin(async { Ok(()) })
        }

        fn kill_descendants(&self, _pid: u32) -> Result<usize, TerminationError> {
            Ok(0)
        }

        fn kill(&self, _pid: u32) -> Result<(), TerminationError> {
            Ok(())
        }
    }

    struct Offline;

    impl Transport for Offline {
        fn fetch<'a>(
            &'a self,
            _request: &'a DownloadRequest,
            _control: TransferControl,
        ) -> BoxFuture<'a, Result<u64, DownloadError>> {
            Box::pin(async { Err(DownloadError::Network("offline".to_string())) })
        }
    }

    impl RemoteVersionService for Offline {
        fn latest_release<'a>(
            &'a self,
            _game_id: &'a str,
        ) -> BoxFuture<'a, Result<RemoteRelease, UpdateCheckError>> {
            Box::pin(async { Err(UpdateCheckError::Remote("offline".to_string())) })
        }
    }

    struct Harness {
        state: LauncherState,
        ui: mpsc::UnboundedReceiver<UiMessage>,
        messages: mpsc::UnboundedReceiver<Message>,
        tmp: TempDir,
    }

    fn harness(table: &[(u32, Liveness)], state_file: bool) -> Harness {
        let tmp = TempDir::new().unwrap();
        let settings = LauncherSettings {
            install_root: tmp.path().join("games"),
            ..LauncherSettings::default()
        };
        let store = JsonSettingsStore::with_settings(tmp.path().join("settings.json"), settings);
        let services = Services {
            settings: Arc::new(store),
            control: Arc::new(TableControl(table.iter().copied().collect())),
            resolver: Arc::new(PreferredExecutableResolver),
            transport: Arc::new(Offline),
            versions: Arc::new(Offline),
        };
        let config = LauncherConfig::default().with_state_file(if state_file {
            Some(tmp.path().join("running_processes.json"))
        } else {
            None
        });

        let (notifier, ui) = EventNotifier::channel();
        let (tx, messages) = mpsc::unbounded_channel();
        Harness {
            state: LauncherState::new(config, services, notifier, tx),
            ui,
            messages,
            tmp,
        }
    }

    fn fake_process(
        state: &mut LauncherState,
        game_id: &str,
        pid: u32,
    ) -> (GameProcess, mpsc::UnboundedReceiver<SupervisorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let process = state.track(
            game_id,
            pid,
            Utc::now(),
            Some(identity(pid)),
            ProcessOrigin::Spawned,
            ProcessHandle::new(tx),
        );
        (process, rx)
    }

    fn events(ui: &mut mpsc::UnboundedReceiver<UiMessage>) -> Vec<UiMessage> {
        let mut out = Vec::new();
        while let Ok(message) = ui.try_recv() {
            out.push(message);
        }
        out
    }

    fn count_stopped(messages: &[UiMessage], game_id: &str) -> usize {
        messages
            .iter()
            .filter(|m| {
                matches!(m, UiMessage::Event(CoreEvent::GameStopped { game_id: id }) if id == game_id)
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn exit_and_forced_kill_finalize_once() {
        let mut h = harness(&[(10, Liveness::Alive)], false);
        let (process, _commands) = fake_process(&mut h.state, "g1", 10);

        h.state.handle(Message::ProcessExited {
            game_id: "g1".to_string(),
            generation: process.generation,
            reason: ExitReason::Exited(Some(0)),
        });
        h.state.handle(Message::ForceKillFinished {
            game_id: "g1".to_string(),
            generation: process.generation,
            result: Ok(0),
        });

        let messages = events(&mut h.ui);
        assert_eq!(count_stopped(&messages, "g1"), 1);
        assert!(!h.state.registry.is_running("g1"));
        assert!(!h.state.playtime.is_active("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_at_watchdog_finalizes_without_kill() {
        let mut h = harness(&[], false);
        let (process, mut commands) = fake_process(&mut h.state, "g1", 10);

        let (reply, stopped) = oneshot::channel();
        h.state.handle(Message::Stop {
            game_id: "g1".to_string(),
            reply,
        });
        assert_eq!(commands.try_recv().unwrap(), SupervisorCommand::Terminate);

        h.state.handle(Message::WatchdogFired {
            game_id: "g1".to_string(),
            generation: process.generation,
            liveness: Liveness::Dead,
        });

        assert_eq!(stopped.await.unwrap(), StopOutcome::Stopped);
        assert!(commands.try_recv().is_err());
        assert_eq!(count_stopped(&events(&mut h.ui), "g1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stop_joins_the_pending_one() {
        let mut h = harness(&[(10, Liveness::Alive)], false);
        let (process, mut commands) = fake_process(&mut h.state, "g1", 10);

        let (first, first_done) = oneshot::channel();
        h.state.handle(Message::Stop {
            game_id: "g1".to_string(),
            reply: first,
        });
        let (second, second_done) = oneshot::channel();
        h.state.handle(Message::Stop {
            game_id: "g1".to_string(),
            reply: second,
        });
        assert_eq!(commands.try_recv().unwrap(), SupervisorCommand::Terminate);
        assert!(commands.try_recv().is_err());

        // Shutdown does not signal a game that is already stopping
        let (reply, _shutdown_done) = oneshot::channel();
        h.state.handle(Message::Shutdown { reply });
        assert!(commands.try_recv().is_err());

        h.state.handle(Message::ProcessExited {
            game_id: "g1".to_string(),
            generation: process.generation,
            reason: ExitReason::Exited(Some(0)),
        });
        assert_eq!(first_done.await.unwrap(), StopOutcome::Stopped);
        assert_eq!(second_done.await.unwrap(), StopOutcome::Stopped);
        assert!(!h.state.terminations.is_stopping("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn alive_at_watchdog_escalates_and_kill_result_finalizes() {
        let mut h = harness(&[(10, Liveness::Alive)], false);
        let (process, mut commands) = fake_process(&mut h.state, "g1", 10);

        let (reply, stopped) = oneshot::channel();
        h.state.handle(Message::Stop {
            game_id: "g1".to_string(),
            reply,
        });
        h.state.handle(Message::WatchdogFired {
            game_id: "g1".to_string(),
            generation: process.generation,
            liveness: Liveness::Alive,
        });
        assert_eq!(commands.try_recv().unwrap(), SupervisorCommand::Terminate);
        assert_eq!(commands.try_recv().unwrap(), SupervisorCommand::Kill);

        // A failed kill still finalizes
        h.state.handle(Message::ForceKillFinished {
            game_id: "g1".to_string(),
            generation: process.generation,
            result: Err(TerminationError::Signal {
                pid: 10,
                message: "EPERM".to_string(),
            }),
        });
        assert_eq!(stopped.await.unwrap(), StopOutcome::Stopped);
        assert!(h.state.registry.is_empty());
    }

    #[tokio::test]
    async fn stale_exit_leaves_new_launch_alone() {
        let mut h = harness(&[], false);
        let (old, _c1) = fake_process(&mut h.state, "g1", 10);
        h.state.handle(Message::ProcessExited {
            game_id: "g1".to_string(),
            generation: old.generation,
            reason: ExitReason::Exited(Some(0)),
        });
        let (new, _c2) = fake_process(&mut h.state, "g1", 11);

        h.state.handle(Message::ProcessExited {
            game_id: "g1".to_string(),
            generation: old.generation,
            reason: ExitReason::Exited(Some(0)),
        });
        assert_eq!(h.state.registry.get("g1").map(|p| p.generation), Some(new.generation));
    }

    #[tokio::test]
    async fn second_launch_is_rejected_and_notified() {
        let mut h = harness(&[], false);
        let _running = fake_process(&mut h.state, "g1", 10);
        events(&mut h.ui);

        let err = h.state.launch(LaunchRequest::new("g1")).unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyRunning(id) if id == "g1"));
        assert!(events(&mut h.ui).iter().any(|m| {
            matches!(m, UiMessage::Notification { title, .. } if title == "Launch failed")
        }));
    }

    #[tokio::test]
    async fn missing_install_is_no_executable() {
        let mut h = harness(&[], false);
        let err = h.state.launch(LaunchRequest::new("nothing-here")).unwrap_err();
        assert!(matches!(err, LaunchError::NoExecutable { .. }));
        assert!(h.state.registry.is_empty());
    }

    #[tokio::test]
    async fn launch_is_refused_while_update_applies() {
        let mut h = harness(&[], false);
        let (job_id, _) = h.state.updates.try_begin("g1", None).unwrap();
        assert!(h.state.open_apply_gate("g1", job_id));

        let err = h.state.launch(LaunchRequest::new("g1")).unwrap_err();
        assert!(matches!(err, LaunchError::Updating(_)));
    }

    #[tokio::test]
    async fn path_like_game_id_is_not_launched() {
        let mut h = harness(&[], false);
        let err = h.state.launch(LaunchRequest::new("../g1")).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidGameId(id) if id == "../g1"));
        assert!(h.state.registry.is_empty());
    }

    fn uninstall(h: &mut Harness, game_id: &str) -> oneshot::Receiver<Result<(), UninstallError>> {
        let (reply, rx) = oneshot::channel();
        h.state.handle(Message::Uninstall {
            game_id: game_id.to_string(),
            reply,
        });
        rx
    }

    /// Feed the next completion the runtime spawned back into it
    async fn pump(h: &mut Harness) {
        let message = tokio::time::timeout(Duration::from_secs(5), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        h.state.handle(message);
    }

    #[tokio::test]
    async fn uninstall_is_refused_while_busy() {
        let mut h = harness(&[], false);
        let _running = fake_process(&mut h.state, "g1", 10);
        h.state.updates.try_begin("g2", None).unwrap();

        let running = uninstall(&mut h, "g1").await.unwrap();
        assert_eq!(running, Err(UninstallError::Running("g1".to_string())));
        let updating = uninstall(&mut h, "g2").await.unwrap();
        assert_eq!(updating, Err(UninstallError::Updating("g2".to_string())));
        let invalid = uninstall(&mut h, "..").await.unwrap();
        assert_eq!(invalid, Err(UninstallError::InvalidGameId("..".to_string())));
        assert!(h.state.uninstalling.is_empty());
    }

    #[tokio::test]
    async fn uninstall_removes_files_and_installed_version() {
        let mut h = harness(&[], false);
        let install_dir = h.tmp.path().join("games/g1");
        std::fs::create_dir_all(install_dir.join("data")).unwrap();
        std::fs::write(install_dir.join("data/level.dat"), "x").unwrap();
        h.state
            .services
            .settings
            .set_installed_version("g1", "1.0.0")
            .unwrap();
        events(&mut h.ui);

        let done = uninstall(&mut h, "g1");

        // Until the removal reports back, the game cannot start or update
        let err = h.state.launch(LaunchRequest::new("g1")).unwrap_err();
        assert!(matches!(err, LaunchError::Uninstalling(_)));
        assert!(matches!(
            h.state.run_update("g1".to_string()),
            UpdateRun::Rejected(_)
        ));
        let again = uninstall(&mut h, "g1").await.unwrap();
        assert_eq!(again, Err(UninstallError::InProgress("g1".to_string())));

        pump(&mut h).await;
        assert_eq!(done.await.unwrap(), Ok(()));
        assert!(!install_dir.exists());
        assert!(h.state.services.settings.installed_version("g1").is_none());
        assert!(events(&mut h.ui).contains(&UiMessage::Event(CoreEvent::GameUninstalled {
            game_id: "g1".to_string(),
        })));

        let missing = uninstall(&mut h, "g1");
        pump(&mut h).await;
        assert_eq!(
            missing.await.unwrap(),
            Err(UninstallError::NotInstalled("g1".to_string()))
        );
    }

    #[tokio::test]
    async fn apply_gate_stays_shut_while_game_runs() {
        let mut h = harness(&[], false);
        let _running = fake_process(&mut h.state, "g1", 10);
        let (job_id, _) = h.state.updates.try_begin("g1", None).unwrap();

        assert!(!h.state.open_apply_gate("g1", job_id));
        assert!(!h.state.updates.is_applying("g1"));
    }

    #[tokio::test]
    async fn close_is_blocked_while_games_run() {
        let mut h = harness(&[], false);
        assert_eq!(h.state.request_close(), CloseDecision::Allowed);

        let _running = fake_process(&mut h.state, "g1", 10);
        events(&mut h.ui);
        assert_eq!(h.state.request_close(), CloseDecision::Blocked { running: 1 });
        assert!(events(&mut h.ui).iter().any(|m| {
            matches!(m, UiMessage::Notification { title, .. } if title == "Cannot close launcher")
        }));
    }

    #[tokio::test]
    async fn failed_update_reports_step_and_reason() {
        let mut h = harness(&[], false);
        let (job_id, _) = h.state.updates.try_begin("g1", None).unwrap();
        h.state.handle(Message::UpdateFinished {
            game_id: "g1".to_string(),
            job_id,
            result: Err(UpdateError::new(UpdateStep::Extracting, "invalid zip")),
        });

        let messages = events(&mut h.ui);
        assert!(messages.contains(&UiMessage::Event(CoreEvent::UpdateStep {
            game_id: "g1".to_string(),
            step: UpdateStep::Failed,
        })));
        assert!(messages.iter().any(|m| matches!(
            m,
            UiMessage::Event(CoreEvent::UpdateFailed { reason, .. }) if reason.contains("extracting")
        )));
        assert_eq!(
            h.state.updates.status("g1"),
            UpdateStatus::Failed {
                step: UpdateStep::Extracting,
                cause: "invalid zip".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn reconcile_adopts_live_and_drops_dead() {
        let mut h = harness(&[(100, Liveness::Alive), (300, Liveness::Alive)], true);
        let path = h.tmp.path().join("running_processes.json");
        let records = vec![
            RunningProcessRecord {
                game_id: "alive".to_string(),
                pid: 100,
                started_at: Utc::now(),
                identity: Some(identity(100)),
            },
            RunningProcessRecord {
                game_id: "gone".to_string(),
                pid: 200,
                started_at: Utc::now(),
                identity: Some(identity(200)),
            },
            // Live pid, but started after the record was written
            RunningProcessRecord {
                game_id: "reused".to_string(),
                pid: 300,
                started_at: Utc::now(),
                identity: Some(identity(1)),
            },
        ];
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        h.state.reconcile();

        let running = h.state.registry.snapshot();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].game_id, "alive");
        assert_eq!(running[0].origin, ProcessOrigin::Adopted);
        assert!(h.state.playtime.is_active("alive"));
        assert!(events(&mut h.ui).contains(&UiMessage::Event(CoreEvent::GameStarted {
            game_id: "alive".to_string(),
        })));

        let persisted = load_records(&path).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].pid, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_games_and_refuses_new_work() {
        let mut h = harness(&[(10, Liveness::Alive)], false);
        let (process, mut commands) = fake_process(&mut h.state, "g1", 10);

        let (reply, done) = oneshot::channel();
        h.state.handle(Message::Shutdown { reply });
        assert_eq!(commands.try_recv().unwrap(), SupervisorCommand::Terminate);
        assert!(!h.state.is_finished());

        let (reply, rejected) = oneshot::channel();
        h.state.handle(Message::Enqueue {
            request: DownloadRequest::new(
                "g2",
                "http://localhost/a.zip",
                h.tmp.path().join("a.zip"),
            ),
            reply,
            completion: None,
        });
        assert_eq!(rejected.await.unwrap().unwrap_err(), DownloadError::Unavailable);

        h.state.handle(Message::ProcessExited {
            game_id: "g1".to_string(),
            generation: process.generation,
            reason: ExitReason::Exited(None),
        });
        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .unwrap()
            .unwrap();
        assert!(h.state.is_finished());
    }
}
