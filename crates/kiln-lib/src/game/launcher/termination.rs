//! Graceful-then-forced termination of running games.
//!
//! A stop sends the graceful signal and arms a watchdog. Two sources then race
//! to complete the stop: the process's own exit event and the watchdog. Both
//! arrive as messages on the runtime's control flow, tagged with the launch
//! generation, and the pending entry here is the one-shot guard that lets only
//! the first of them finalize.

use crate::game::launcher::process::ProcessControl;
use crate::game::launcher::types::GameProcess;
use crate::runtime::message::Message;
use crate::utils::Liveness;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the runtime should do when a watchdog fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogAction {
    /// Stale or already completed stop
    Ignore,
    /// Process is already gone: finalize without killing
    Finalize,
    /// Process is still alive: force-kill its tree
    Escalate,
    /// Liveness unknown: the watchdog was re-armed
    Recheck,
}

struct PendingStop {
    generation: u64,
    pid: u32,
    watchdog: Option<JoinHandle<()>>,
    rechecks: u32,
}

pub(crate) struct TerminationController {
    pending: HashMap<String, PendingStop>,
    watchdog_timeout: Duration,
    recheck_limit: u32,
    control: Arc<dyn ProcessControl>,
}

impl TerminationController {
    pub fn new(
        watchdog_timeout: Duration,
        recheck_limit: u32,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            watchdog_timeout,
            recheck_limit,
            control,
        }
    }

    /// Start stopping `process`. Returns `false` if a stop for this launch is
    /// already in progress.
    pub fn begin(&mut self, process: &GameProcess, tx: &mpsc::UnboundedSender<Message>) -> bool {
        if let Some(existing) = self.pending.get(&process.game_id) {
            if existing.generation == process.generation {
                log::debug!("[stop] {} is already stopping", process.game_id);
                return false;
            }
        }
        // A leftover guard from an older launch is replaced
        self.complete_any(&process.game_id);

        log::info!(
            "[stop] stopping {} (PID {}, generation {})",
            process.game_id,
            process.pid,
            process.generation
        );
        if !process.handle.terminate() {
            log::debug!("[stop] supervisor for {} already finished", process.game_id);
        }

        let watchdog = self.arm(&process.game_id, process.generation, process.pid, tx);
        self.pending.insert(
            process.game_id.clone(),
            PendingStop {
                generation: process.generation,
                pid: process.pid,
                watchdog: Some(watchdog),
                rechecks: 0,
            },
        );
        true
    }

    fn arm(
        &self,
        game_id: &str,
        generation: u64,
        pid: u32,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> JoinHandle<()> {
        let game_id = game_id.to_string();
        let timeout = self.watchdog_timeout;
        let control = self.control.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let liveness = tokio::task::spawn_blocking(move || control.liveness(pid))
                .await
                .unwrap_or(Liveness::Unknown);
            let _ = tx.send(Message::WatchdogFired {
                game_id,
                generation,
                liveness,
            });
        })
    }

    /// Decide what a fired watchdog means for the pending stop
    pub fn on_watchdog(
        &mut self,
        game_id: &str,
        generation: u64,
        liveness: Liveness,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> WatchdogAction {
        let (pid, rechecks) = match self.pending.get_mut(game_id) {
            Some(pending) if pending.generation == generation => {
                pending.watchdog = None;
                (pending.pid, pending.rechecks)
            }
            _ => return WatchdogAction::Ignore,
        };

        match liveness {
            Liveness::Dead => {
                log::info!("[stop] {} exited before the watchdog, no kill needed", game_id);
                WatchdogAction::Finalize
            }
            Liveness::Alive => {
                log::warn!("[stop] {} ignored the graceful signal, escalating", game_id);
                WatchdogAction::Escalate
            }
            Liveness::Unknown if rechecks < self.recheck_limit => {
                log::warn!(
                    "[stop] liveness of {} (PID {}) unknown, re-checking ({}/{})",
                    game_id,
                    pid,
                    rechecks + 1,
                    self.recheck_limit
                );
                let watchdog = self.arm(game_id, generation, pid, tx);
                if let Some(pending) = self.pending.get_mut(game_id) {
                    pending.rechecks += 1;
                    pending.watchdog = Some(watchdog);
                }
                WatchdogAction::Recheck
            }
            Liveness::Unknown => {
                log::warn!("[stop] liveness of {} still unknown, escalating", game_id);
                WatchdogAction::Escalate
            }
        }
    }

    /// Clear the guard for this launch and cancel its watchdog
    pub fn complete(&mut self, game_id: &str, generation: u64) {
        if matches!(self.pending.get(game_id), Some(p) if p.generation == generation) {
            self.complete_any(game_id);
        }
    }

    fn complete_any(&mut self, game_id: &str) {
        if let Some(pending) = self.pending.remove(game_id) {
            if let Some(watchdog) = pending.watchdog {
                watchdog.abort();
            }
        }
    }

    pub fn is_stopping(&self, game_id: &str) -> bool {
        self.pending.contains_key(game_id)
    }
}
