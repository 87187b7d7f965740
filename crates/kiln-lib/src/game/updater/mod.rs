//! Per-game updates: check → download → extract → apply.
//!
//! [`UpdateOrchestrator`] is the job table owned by the launcher runtime. The
//! steps themselves run in [`drive`], a spawned task that reports every
//! transition back to the runtime as a message and reaches the download queue
//! through the same channel as any other client.

pub mod archive;
pub mod remote;
pub mod transaction;
pub mod types;

pub use remote::{HttpVersionService, RemoteVersionService};
pub use transaction::{InstallSwap, SwapError};
pub use types::{
    RemoteRelease, UpdateCheck, UpdateJob, UpdateOutcome, UpdateRun, UpdateStatus, UpdateStep,
};

use crate::config::KILN_DIR;
use crate::error::{UpdateCheckError, UpdateError};
use crate::game::installer::{DownloadOutcome, DownloadRequest};
use crate::game::library::is_valid_game_id;
use crate::runtime::message::Message;
use crate::settings::SettingsStore;
use crate::utils::is_newer;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct ActiveJob {
    job_id: u64,
    job: UpdateJob,
}

#[derive(Default)]
pub struct UpdateOrchestrator {
    jobs: HashMap<String, ActiveJob>,
    last: HashMap<String, UpdateStatus>,
    waiters: HashMap<String, Vec<oneshot::Sender<UpdateStatus>>>,
    next_job_id: u64,
}

impl UpdateOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job for `game_id`. If one is already in flight, its status is
    /// returned as the error and nothing changes.
    pub fn try_begin(
        &mut self,
        game_id: &str,
        from_version: Option<String>,
    ) -> Result<(u64, UpdateStatus), UpdateStatus> {
        if let Some(active) = self.jobs.get(game_id) {
            return Err(UpdateStatus::from(&active.job));
        }

        self.next_job_id += 1;
        let job_id = self.next_job_id;
        let job = UpdateJob {
            game_id: game_id.to_string(),
            from_version,
            to_version: None,
            step: UpdateStep::Checking,
        };
        let status = UpdateStatus::from(&job);
        self.jobs
            .insert(game_id.to_string(), ActiveJob { job_id, job });
        self.last.insert(game_id.to_string(), status.clone());
        Ok((job_id, status))
    }

    /// Record a step transition. `false` for unknown or stale jobs.
    pub fn advance(
        &mut self,
        game_id: &str,
        job_id: u64,
        step: UpdateStep,
        to_version: Option<String>,
    ) -> bool {
        let Some(active) = self.jobs.get_mut(game_id).filter(|a| a.job_id == job_id) else {
            return false;
        };
        active.job.step = step;
        if to_version.is_some() {
            active.job.to_version = to_version;
        }
        self.last
            .insert(game_id.to_string(), UpdateStatus::from(&active.job));
        true
    }

    /// End the job and publish its final status. `None` for stale jobs.
    pub fn finish(
        &mut self,
        game_id: &str,
        job_id: u64,
        result: Result<UpdateOutcome, UpdateError>,
    ) -> Option<UpdateStatus> {
        if !self.is_current(game_id, job_id) {
            return None;
        }
        self.jobs.remove(game_id);

        let status = match result {
            Ok(UpdateOutcome::UpToDate { version }) => UpdateStatus::UpToDate { version },
            Ok(UpdateOutcome::Done { version }) => UpdateStatus::Done { version },
            Err(e) => UpdateStatus::Failed {
                step: e.step,
                cause: e.cause,
            },
        };
        self.last.insert(game_id.to_string(), status.clone());

        if let Some(waiters) = self.waiters.remove(game_id) {
            for waiter in waiters {
                let _ = waiter.send(status.clone());
            }
        }
        Some(status)
    }

    pub fn current_step(&self, game_id: &str, job_id: u64) -> Option<UpdateStep> {
        self.jobs
            .get(game_id)
            .filter(|a| a.job_id == job_id)
            .map(|a| a.job.step)
    }

    pub fn is_current(&self, game_id: &str, job_id: u64) -> bool {
        self.current_step(game_id, job_id).is_some()
    }

    /// Some job is in flight for this game, whatever its step
    pub fn has_job(&self, game_id: &str) -> bool {
        self.jobs.contains_key(game_id)
    }

    /// The in-flight job is swapping files for this game
    pub fn is_applying(&self, game_id: &str) -> bool {
        matches!(self.jobs.get(game_id), Some(a) if a.job.step == UpdateStep::Applying)
    }

    pub fn status(&self, game_id: &str) -> UpdateStatus {
        self.last
            .get(game_id)
            .cloned()
            .unwrap_or(UpdateStatus::Idle)
    }

    /// Resolve once no job is in flight for `game_id`
    pub fn wait_for(&mut self, game_id: &str, reply: oneshot::Sender<UpdateStatus>) {
        if self.jobs.contains_key(game_id) {
            self.waiters.entry(game_id.to_string()).or_default().push(reply);
        } else {
            let _ = reply.send(self.status(game_id));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }
}

/// Compare the installed version with the remote latest. No side effects.
pub async fn check_for_update(
    versions: &dyn RemoteVersionService,
    settings: &dyn SettingsStore,
    game_id: &str,
) -> Result<UpdateCheck, UpdateCheckError> {
    if !is_valid_game_id(game_id) {
        return Err(UpdateCheckError::InvalidGameId(game_id.to_string()));
    }
    let installed = settings.installed_version(game_id);
    let release = versions.latest_release(game_id).await?;
    Ok(compare(game_id, installed, &release))
}

fn compare(game_id: &str, installed: Option<String>, release: &RemoteRelease) -> UpdateCheck {
    // Nothing recorded means nothing usable is installed
    let update_available = match &installed {
        Some(installed) => is_newer(&release.version, installed),
        None => true,
    };
    UpdateCheck {
        game_id: game_id.to_string(),
        installed,
        latest: release.version.clone(),
        update_available,
    }
}

/// Collaborators a running update needs
#[derive(Clone)]
pub(crate) struct UpdateContext {
    pub tx: mpsc::UnboundedSender<Message>,
    pub versions: Arc<dyn RemoteVersionService>,
    pub settings: Arc<dyn SettingsStore>,
}

/// Run `drive` on its own task. A panic is reported as an aborted job.
pub(crate) fn spawn_update(ctx: UpdateContext, game_id: String, job_id: u64) {
    tokio::spawn(async move {
        let tx = ctx.tx.clone();
        let result = AssertUnwindSafe(drive(ctx, game_id.clone(), job_id))
            .catch_unwind()
            .await;

        let message = match result {
            Ok(result) => Message::UpdateFinished {
                game_id,
                job_id,
                result,
            },
            Err(_) => {
                log::error!("[update:{}] update task panicked", game_id);
                Message::UpdateAborted {
                    game_id,
                    job_id,
                    reason: "update task panicked".to_string(),
                }
            }
        };
        let _ = tx.send(message);
    });
}

fn runtime_gone(step: UpdateStep) -> UpdateError {
    UpdateError::new(step, "launcher runtime stopped")
}

/// Keep version strings usable as file names
fn file_safe(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn discard_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Drive one update job through its steps
pub(crate) async fn drive(
    ctx: UpdateContext,
    game_id: String,
    job_id: u64,
) -> Result<UpdateOutcome, UpdateError> {
    let report = |step: UpdateStep, to_version: Option<String>| {
        let _ = ctx.tx.send(Message::UpdateStepReached {
            game_id: game_id.clone(),
            job_id,
            step,
            to_version,
        });
    };

    // Checking
    let installed = ctx.settings.installed_version(&game_id);
    let release = ctx
        .versions
        .latest_release(&game_id)
        .await
        .map_err(|e| UpdateError::new(UpdateStep::Checking, e.to_string()))?;
    let check = compare(&game_id, installed, &release);
    if !check.update_available {
        log::info!("[update:{}] up to date at {}", game_id, release.version);
        return Ok(UpdateOutcome::UpToDate {
            version: check.installed,
        });
    }
    log::info!(
        "[update:{}] {} -> {}",
        game_id,
        check.installed.as_deref().unwrap_or("none"),
        release.version
    );

    // Downloading
    report(UpdateStep::Downloading, Some(release.version.clone()));
    let install_root = ctx.settings.install_root();
    let kiln_dir = install_root.join(KILN_DIR);
    let archive = kiln_dir.join("downloads").join(format!(
        "{}-{}.zip",
        game_id,
        file_safe(&release.version)
    ));
    let request = DownloadRequest::new(&game_id, &release.archive_url, &archive)
        .with_sha256(release.sha256.clone());

    let (reply_tx, reply_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel::<DownloadOutcome>();
    ctx.tx
        .send(Message::Enqueue {
            request,
            reply: reply_tx,
            completion: Some(done_tx),
        })
        .map_err(|_| runtime_gone(UpdateStep::Downloading))?;
    reply_rx
        .await
        .map_err(|_| runtime_gone(UpdateStep::Downloading))?
        .map_err(|e| UpdateError::new(UpdateStep::Downloading, e.to_string()))?;
    done_rx
        .await
        .map_err(|_| runtime_gone(UpdateStep::Downloading))?
        .map_err(|e| UpdateError::new(UpdateStep::Downloading, e.to_string()))?;

    // Extracting
    report(UpdateStep::Extracting, None);
    let staging = kiln_dir
        .join("staging")
        .join(format!("{}-{}", game_id, uuid::Uuid::new_v4()));
    let extracted = {
        let archive = archive.clone();
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || archive::extract_zip(&archive, &staging)).await
    };
    let files: Vec<PathBuf> = match extracted {
        Ok(Ok(files)) => files,
        Ok(Err(e)) => {
            discard_dir(&staging).await;
            return Err(UpdateError::new(UpdateStep::Extracting, format!("{:#}", e)));
        }
        Err(e) => {
            discard_dir(&staging).await;
            return Err(UpdateError::new(UpdateStep::Extracting, e.to_string()));
        }
    };

    // Applying: the runtime refuses while the game runs, and blocks launches
    // until the job finishes
    let (gate_tx, gate_rx) = oneshot::channel();
    ctx.tx
        .send(Message::ApplyGate {
            game_id: game_id.clone(),
            job_id,
            reply: gate_tx,
        })
        .map_err(|_| runtime_gone(UpdateStep::Applying))?;
    if !gate_rx.await.unwrap_or(false) {
        discard_dir(&staging).await;
        return Err(UpdateError::new(
            UpdateStep::Applying,
            "game is running; stop it before updating",
        ));
    }

    let applied = {
        let staging = staging.clone();
        let game_id = game_id.clone();
        let install_root = install_root.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            archive::verify_staging(&staging, &files)?;
            InstallSwap::new(&game_id, &install_root).apply(&staging)?;
            Ok(())
        })
        .await
    };
    match applied {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            discard_dir(&staging).await;
            return Err(UpdateError::new(UpdateStep::Applying, format!("{:#}", e)));
        }
        Err(e) => {
            discard_dir(&staging).await;
            return Err(UpdateError::new(UpdateStep::Applying, e.to_string()));
        }
    }

    if let Err(e) = ctx
        .settings
        .set_installed_version(&game_id, &release.version)
    {
        log::warn!("[update:{}] failed to record installed version: {:#}", game_id, e);
    }
    if let Err(e) = tokio::fs::remove_file(&archive).await {
        log::debug!("[update:{}] could not remove archive {:?}: {}", game_id, archive, e);
    }

    Ok(UpdateOutcome::Done {
        version: release.version,
    })
}
