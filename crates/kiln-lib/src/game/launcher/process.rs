/// Game process spawning and supervision
use crate::error::{LaunchError, TerminationError};
use crate::game::launcher::types::{ExitReason, SupervisorCommand};
use crate::runtime::message::Message;
use crate::utils::process::{self as os, KilnCommandExt, Liveness, ProcessIdentity};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;

/// OS process operations used by the launcher. Substituted in tests.
pub trait ProcessControl: Send + Sync + 'static {
    /// Whether `pid` is still running
    fn liveness(&self, pid: u32) -> Liveness;

    /// Start time and executable of `pid`, used to tell it apart from a later
    /// process that reused the id
    fn identify(&self, pid: u32) -> Option<ProcessIdentity>;

    /// Ask the process to shut down gracefully
    fn terminate(&self, pid: u32) -> BoxFuture<'_, Result<(), TerminationError>>;

    /// Force-kill every descendant of `pid` (not `pid` itself)
    fn kill_descendants(&self, pid: u32) -> Result<usize, TerminationError>;

    /// Force-kill `pid` by id. Only used for adopted processes, which have no
    /// child handle.
    fn kill(&self, pid: u32) -> Result<(), TerminationError>;
}

/// [`ProcessControl`] backed by the real OS
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn liveness(&self, pid: u32) -> Liveness {
        os::pid_liveness(pid)
    }

    fn identify(&self, pid: u32) -> Option<ProcessIdentity> {
        os::process_identity(pid)
    }

    fn terminate(&self, pid: u32) -> BoxFuture<'_, Result<(), TerminationError>> {
        Box::pin(os::terminate_pid(pid))
    }

    fn kill_descendants(&self, pid: u32) -> Result<usize, TerminationError> {
        os::kill_descendants(pid)
    }

    fn kill(&self, pid: u32) -> Result<(), TerminationError> {
        os::kill_pid(pid)
    }
}

/// Check that the executable exists and is a regular file, and return its
/// canonical path
pub fn validate_executable(path: &Path) -> Result<PathBuf, LaunchError> {
    if !path.is_file() {
        return Err(LaunchError::InvalidExecutable(path.to_path_buf()));
    }
    dunce::canonicalize(path).map_err(|_| LaunchError::InvalidExecutable(path.to_path_buf()))
}

/// Spawn the game as a non-detached child with null stdio.
///
/// `work_dir` defaults to the executable's directory.
pub fn spawn_game(
    executable: &Path,
    work_dir: Option<&Path>,
    args: &[String],
) -> Result<(u32, Child), LaunchError> {
    let work_dir = work_dir
        .map(Path::to_path_buf)
        .or_else(|| executable.parent().map(Path::to_path_buf));

    let mut command = tokio::process::Command::new(executable);
    command.args(args).null_stdio().suppress_console();
    if let Some(dir) = &work_dir {
        command.current_dir(dir);
    }
    // The supervisor owns the child; dropping it must not kill the game
    command.kill_on_drop(false);

    log::debug!("[launch] exec {:?} {:?} (cwd {:?})", executable, args, work_dir);

    let child = command.spawn().map_err(|source| LaunchError::Spawn {
        path: executable.to_path_buf(),
        source,
    })?;

    // A child that already exited and was reaped has no id
    let pid = child.id().ok_or_else(|| LaunchError::Spawn {
        path: executable.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "process exited during spawn"),
    })?;

    Ok((pid, child))
}

async fn kill_tree_blocking(
    control: &Arc<dyn ProcessControl>,
    pid: u32,
) -> Result<usize, TerminationError> {
    let control = control.clone();
    match tokio::task::spawn_blocking(move || control.kill_descendants(pid)).await {
        Ok(result) => result,
        Err(e) => Err(TerminationError::Signal {
            pid,
            message: format!("descendant kill task failed: {}", e),
        }),
    }
}

/// Own a spawned child until it exits, executing terminate/kill commands
/// against it. Reports exactly one [`Message::ProcessExited`].
pub(crate) async fn supervise_child(
    game_id: String,
    generation: u64,
    pid: u32,
    mut child: Child,
    mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    control: Arc<dyn ProcessControl>,
    tx: mpsc::UnboundedSender<Message>,
) {
    let mut commands_open = true;

    let reason = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => {
                        if status.success() {
                            log::info!("Game process {} (PID {}) exited successfully", game_id, pid);
                        } else {
                            log::warn!("Game process {} (PID {}) exited with: {}", game_id, pid, status);
                        }
                        ExitReason::Exited(status.code())
                    }
                    Err(e) => {
                        log::error!("Failed to wait for game process {} (PID {}): {}", game_id, pid, e);
                        ExitReason::WaitFailed(e.to_string())
                    }
                };
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(SupervisorCommand::Terminate) => {
                        log::info!("[stop] terminating {} (PID {})", game_id, pid);
                        if let Err(e) = control.terminate(pid).await {
                            log::warn!("[stop] {}", e);
                        }
                    }
                    Some(SupervisorCommand::Kill) => {
                        log::warn!("[stop] force killing {} (PID {}) and its children", game_id, pid);
                        let descendants = kill_tree_blocking(&control, pid).await;
                        // The child has not been reaped yet, so the pid is still ours
                        let root = child.start_kill().map_err(|e| TerminationError::Signal {
                            pid,
                            message: e.to_string(),
                        });
                        let result = match (descendants, root) {
                            (Ok(count), Ok(())) => Ok(count),
                            (Err(e), _) | (_, Err(e)) => Err(e),
                        };
                        let _ = tx.send(Message::ForceKillFinished {
                            game_id: game_id.clone(),
                            generation,
                            result,
                        });
                    }
                    None => commands_open = false,
                }
            }
        }
    };

    let _ = tx.send(Message::ProcessExited {
        game_id,
        generation,
        reason,
    });
}

/// Poll an adopted pid until it disappears. Adopted processes have no child
/// handle, so signals go by pid, and only after the pid is confirmed to still
/// be the recorded process.
pub(crate) async fn supervise_adopted(
    game_id: String,
    generation: u64,
    pid: u32,
    identity: ProcessIdentity,
    poll_interval: Duration,
    mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    control: Arc<dyn ProcessControl>,
    tx: mpsc::UnboundedSender<Message>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let vanished = |game_id: String| {
        let _ = tx.send(Message::ProcessExited {
            game_id,
            generation,
            reason: ExitReason::Vanished,
        });
    };

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let checker = control.clone();
                let liveness = tokio::task::spawn_blocking(move || checker.liveness(pid))
                    .await
                    .unwrap_or(Liveness::Unknown);
                if liveness == Liveness::Dead {
                    log::info!("Adopted game {} (PID {}) has exited", game_id, pid);
                    vanished(game_id);
                    return;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    // Dropped from the registry; nobody is listening any more
                    return;
                };

                let identify_control = control.clone();
                let current = tokio::task::spawn_blocking(move || identify_control.identify(pid))
                    .await
                    .ok()
                    .flatten();
                if !current.is_some_and(|current| identity.matches(&current)) {
                    log::warn!(
                        "[stop] PID {} no longer belongs to adopted {}, not signalling it",
                        pid,
                        game_id
                    );
                    vanished(game_id);
                    return;
                }

                match command {
                    SupervisorCommand::Terminate => {
                        log::info!("[stop] terminating adopted {} (PID {})", game_id, pid);
                        if let Err(e) = control.terminate(pid).await {
                            log::warn!("[stop] {}", e);
                        }
                    }
                    SupervisorCommand::Kill => {
                        log::warn!("[stop] force killing adopted {} (PID {})", game_id, pid);
                        let descendants = kill_tree_blocking(&control, pid).await;
                        let kill_control = control.clone();
                        let root = tokio::task::spawn_blocking(move || kill_control.kill(pid))
                            .await
                            .unwrap_or_else(|e| {
                                Err(TerminationError::Signal {
                                    pid,
                                    message: e.to_string(),
                                })
                            });
                        let result = match (descendants, root) {
                            (Ok(count), Ok(())) => Ok(count),
                            (Err(e), _) | (_, Err(e)) => Err(e),
                        };
                        let _ = tx.send(Message::ForceKillFinished {
                            game_id: game_id.clone(),
                            generation,
                            result,
                        });
                    }
                }
            }
        }
    }
}
