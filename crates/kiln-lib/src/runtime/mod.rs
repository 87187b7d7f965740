//! The launcher runtime: one task that owns all state, and a cheap handle to
//! talk to it.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use kiln_lib::runtime::Launcher;
//! use kiln_lib::settings::JsonSettingsStore;
//! use kiln_lib::game::launcher::LaunchRequest;
//! use std::sync::Arc;
//!
//! let settings = Arc::new(JsonSettingsStore::open_default()?);
//! let launcher = Launcher::builder(settings).start()?;
//! launcher.launch(LaunchRequest::new("space-miner")).await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod message;
pub(crate) mod state;

use crate::config::LauncherConfig;
use crate::error::{DownloadError, LaunchError, UninstallError, UpdateCheckError};
use crate::game::installer::{
    DownloadOutcome, DownloadRequest, DownloadTask, HttpTransport, Transport,
};
use crate::game::launcher::{
    CloseDecision, ExecutableResolver, LaunchRequest, OsProcessControl, PreferredExecutableResolver,
    ProcessControl, RunningGame, StopOutcome,
};
use crate::game::library::{self, is_valid_game_id, InstalledGame};
use crate::game::playtime::{format_duration, PlaytimeTotal};
use crate::game::updater::{
    check_for_update, HttpVersionService, RemoteRelease, RemoteVersionService, UpdateCheck,
    UpdateRun, UpdateStatus,
};
use crate::notify::EventNotifier;
use crate::settings::SettingsStore;
use anyhow::Context;
use futures::future::BoxFuture;
use message::{Message, Reply};
use state::{LauncherState, Services};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Handle to a running launcher core. Clones share the same runtime.
#[derive(Clone)]
pub struct Launcher {
    tx: mpsc::UnboundedSender<Message>,
    settings: Arc<dyn SettingsStore>,
    versions: Arc<dyn RemoteVersionService>,
}

impl Launcher {
    pub fn builder(settings: Arc<dyn SettingsStore>) -> LauncherBuilder {
        LauncherBuilder::new(settings)
    }

    /// Send a request and wait for its reply. `None` once the runtime is gone.
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Message) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).ok()?;
        rx.await.ok()
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<RunningGame, LaunchError> {
        self.request(|reply| Message::Launch { request, reply })
            .await
            .unwrap_or(Err(LaunchError::Unavailable))
    }

    /// Stop a game, escalating to a forced kill if it ignores the graceful
    /// signal. Resolves once the game is gone.
    pub async fn stop(&self, game_id: &str) -> StopOutcome {
        let game_id = game_id.to_string();
        self.request(|reply| Message::Stop { game_id, reply })
            .await
            .unwrap_or(StopOutcome::NotRunning)
    }

    pub async fn is_running(&self, game_id: &str) -> bool {
        let game_id = game_id.to_string();
        self.request(|reply| Message::IsRunning { game_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn running_games(&self) -> Vec<RunningGame> {
        self.request(|reply| Message::ListRunning { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn playtime(&self, game_id: &str) -> PlaytimeTotal {
        let id = game_id.to_string();
        match self.request(|reply| Message::Playtime { game_id: id, reply }).await {
            Some(total) => total,
            None => {
                let seconds = self.settings.playtime_seconds(game_id);
                PlaytimeTotal {
                    game_id: game_id.to_string(),
                    seconds,
                    formatted: format_duration(seconds),
                    in_session: false,
                }
            }
        }
    }

    /// Whether the host may close its window now
    pub async fn request_close(&self) -> CloseDecision {
        self.request(|reply| Message::RequestClose { reply })
            .await
            .unwrap_or(CloseDecision::Allowed)
    }

    pub async fn enqueue_download(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadTask, DownloadError> {
        self.request(|reply| Message::Enqueue {
            request,
            reply,
            completion: None,
        })
        .await
        .unwrap_or(Err(DownloadError::Unavailable))
    }

    /// Wait for a download to reach a terminal state
    pub async fn wait_download(&self, game_id: &str) -> DownloadOutcome {
        let game_id = game_id.to_string();
        self.request(|reply| Message::WaitDownload { game_id, reply })
            .await
            .unwrap_or(Err(DownloadError::Unavailable))
    }

    pub async fn cancel_download(&self, game_id: &str) -> bool {
        let game_id = game_id.to_string();
        self.request(|reply| Message::CancelDownload { game_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn pause_download(&self, game_id: &str) -> bool {
        let game_id = game_id.to_string();
        self.request(|reply| Message::PauseDownload { game_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn resume_download(&self, game_id: &str) -> bool {
        let game_id = game_id.to_string();
        self.request(|reply| Message::ResumeDownload { game_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Forget a finished, failed or canceled download
    pub async fn clear_download(&self, game_id: &str) -> bool {
        let game_id = game_id.to_string();
        self.request(|reply| Message::ClearDownload { game_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn downloads(&self) -> Vec<DownloadTask> {
        self.request(|reply| Message::ListDownloads { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn download(&self, game_id: &str) -> Option<DownloadTask> {
        self.downloads()
            .await
            .into_iter()
            .find(|task| task.game_id == game_id)
    }

    /// Compare the installed version with the remote one. Touches no state.
    pub async fn check_update(&self, game_id: &str) -> Result<UpdateCheck, UpdateCheckError> {
        check_for_update(self.versions.as_ref(), self.settings.as_ref(), game_id).await
    }

    /// Start an update job, unless one is already in flight
    pub async fn run_update(&self, game_id: &str) -> Result<UpdateRun, UpdateCheckError> {
        if !is_valid_game_id(game_id) {
            return Err(UpdateCheckError::InvalidGameId(game_id.to_string()));
        }
        let game_id = game_id.to_string();
        self.request(|reply| Message::RunUpdate { game_id, reply })
            .await
            .ok_or(UpdateCheckError::Unavailable)
    }

    pub async fn update_status(&self, game_id: &str) -> UpdateStatus {
        let game_id = game_id.to_string();
        self.request(|reply| Message::QueryUpdate { game_id, reply })
            .await
            .unwrap_or(UpdateStatus::Idle)
    }

    /// Wait until no update job is in flight and return the last status
    pub async fn wait_update(&self, game_id: &str) -> UpdateStatus {
        let game_id = game_id.to_string();
        self.request(|reply| Message::WaitUpdate { game_id, reply })
            .await
            .unwrap_or(UpdateStatus::Idle)
    }

    /// Remove a game's install dir and forget its installed version. Refused
    /// while the game runs or an update job for it is in flight.
    pub async fn uninstall(&self, game_id: &str) -> Result<(), UninstallError> {
        let game_id = game_id.to_string();
        self.request(|reply| Message::Uninstall { game_id, reply })
            .await
            .unwrap_or(Err(UninstallError::Unavailable))
    }

    /// Games found under the install root, with their size on disk
    pub async fn installed_games(&self) -> Vec<InstalledGame> {
        let settings = self.settings.clone();
        let listed =
            tokio::task::spawn_blocking(move || library::installed_games(settings.as_ref())).await;
        match listed {
            Ok(Ok(games)) => games,
            Ok(Err(e)) => {
                log::warn!("[library] failed to list installed games: {:#}", e);
                Vec::new()
            }
            Err(e) => {
                log::error!("[library] listing task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Bytes used by one game's install dir, `None` if it is not installed
    pub async fn game_size(&self, game_id: &str) -> Option<u64> {
        let settings = self.settings.clone();
        let game_id = game_id.to_string();
        tokio::task::spawn_blocking(move || library::game_size(settings.as_ref(), &game_id))
            .await
            .ok()
            .flatten()
    }

    /// Stop every game and cancel every download, then stop the runtime.
    /// Later requests fail with `Unavailable`.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Message::Shutdown { reply }).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Used when the host configured no update server
struct NoVersionService;

impl RemoteVersionService for NoVersionService {
    fn latest_release<'a>(
        &'a self,
        _game_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRelease, UpdateCheckError>> {
        Box::pin(async { Err(UpdateCheckError::Remote("no update server configured".to_string())) })
    }
}

pub struct LauncherBuilder {
    settings: Arc<dyn SettingsStore>,
    config: LauncherConfig,
    notifier: EventNotifier,
    control: Option<Arc<dyn ProcessControl>>,
    resolver: Option<Arc<dyn ExecutableResolver>>,
    transport: Option<Arc<dyn Transport>>,
    versions: Option<Arc<dyn RemoteVersionService>>,
    update_server: Option<String>,
}

impl LauncherBuilder {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            config: LauncherConfig::default(),
            notifier: EventNotifier::silent(),
            control: None,
            resolver: None,
            transport: None,
            versions: None,
            update_server: None,
        }
    }

    pub fn with_config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExecutableResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_version_service(mut self, versions: Arc<dyn RemoteVersionService>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Use [`HttpVersionService`] against `base_url`
    pub fn with_update_server(mut self, base_url: impl Into<String>) -> Self {
        self.update_server = Some(base_url.into());
        self
    }

    /// Spawn the runtime task on the current tokio runtime, after adopting
    /// any games a previous session left running.
    pub fn start(self) -> anyhow::Result<Launcher> {
        tokio::runtime::Handle::try_current()
            .context("Launcher must be started from within a tokio runtime")?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(self.config.connect_timeout)
                    .context("Failed to build download client")?,
            ),
        };
        let versions: Arc<dyn RemoteVersionService> = match (self.versions, self.update_server) {
            (Some(versions), _) => versions,
            (None, Some(base_url)) => Arc::new(
                HttpVersionService::new(&base_url, self.config.connect_timeout)
                    .context("Failed to build version service")?,
            ),
            (None, None) => Arc::new(NoVersionService),
        };

        let services = Services {
            settings: self.settings.clone(),
            control: self.control.unwrap_or_else(|| Arc::new(OsProcessControl)),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(PreferredExecutableResolver)),
            transport,
            versions: versions.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = LauncherState::new(self.config, services, self.notifier, tx.clone());
        state.reconcile();
        tokio::spawn(run(state, rx));

        Ok(Launcher {
            tx,
            settings: self.settings,
            versions,
        })
    }
}

async fn run(mut state: LauncherState, mut rx: mpsc::UnboundedReceiver<Message>) {
    log::info!("[runtime] started");
    while let Some(message) = rx.recv().await {
        state.handle(message);
        if state.is_finished() {
            break;
        }
    }
    log::info!("[runtime] stopped");
}
