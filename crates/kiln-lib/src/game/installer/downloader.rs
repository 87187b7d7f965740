//! Bounded-concurrency download queue.
//!
//! The coordinator is plain state owned by the launcher runtime. It decides
//! which transfers start and hands them out as [`Admission`]s, and it folds
//! progress and completion reports back in. Freeing a slot and promoting the
//! queue head happen inside one `&mut self` call, so two completions can never
//! both observe a free slot.

use crate::error::DownloadError;
use crate::game::installer::types::{DownloadRequest, DownloadState, DownloadTask};
use crate::game::library::is_valid_game_id;
use crate::notify::CoreEvent;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

pub type DownloadOutcome = Result<DownloadTask, DownloadError>;

/// A transfer the caller must start now
#[derive(Debug)]
pub struct Admission {
    pub transfer_id: u64,
    pub request: DownloadRequest,
    pub cancel: watch::Receiver<bool>,
    pub pause: watch::Receiver<bool>,
}

struct ActiveTransfer {
    transfer_id: u64,
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
}

struct Entry {
    task: DownloadTask,
    request: DownloadRequest,
    failure: Option<DownloadError>,
    last_forwarded: Option<Instant>,
}

pub struct DownloadCoordinator {
    max_concurrent: usize,
    progress_interval: Duration,
    entries: HashMap<String, Entry>,
    queue: VecDeque<String>,
    active: HashMap<String, ActiveTransfer>,
    waiters: HashMap<String, Vec<oneshot::Sender<DownloadOutcome>>>,
    next_transfer_id: u64,
    outbox: Vec<CoreEvent>,
}

impl DownloadCoordinator {
    pub fn new(max_concurrent: usize, progress_interval: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            progress_interval,
            entries: HashMap::new(),
            queue: VecDeque::new(),
            active: HashMap::new(),
            waiters: HashMap::new(),
            next_transfer_id: 1,
            outbox: Vec::new(),
        }
    }

    /// Queue a download. Admits it right away when a slot is free.
    pub fn enqueue(
        &mut self,
        request: DownloadRequest,
    ) -> Result<(DownloadTask, Vec<Admission>), DownloadError> {
        let game_id = request.game_id.clone();
        if !is_valid_game_id(&game_id) {
            return Err(DownloadError::InvalidGameId(game_id));
        }
        if let Some(entry) = self.entries.get(&game_id) {
            if !entry.task.state.is_terminal() {
                return Err(DownloadError::AlreadyQueued(game_id));
            }
        }

        log::info!("[download] queued {} from {}", game_id, request.url);
        let entry = Entry {
            task: DownloadTask::queued(&request),
            request,
            failure: None,
            last_forwarded: None,
        };
        // Replaces any terminal record for this game
        self.entries.insert(game_id.clone(), entry);
        self.queue.push_back(game_id.clone());
        self.emit_state(&game_id, DownloadState::Queued);

        let admissions = self.promote();
        let task = self
            .get(&game_id)
            .ok_or_else(|| DownloadError::NotFound(game_id.clone()))?;
        Ok((task, admissions))
    }

    /// Fill free slots from the head of the queue
    fn promote(&mut self) -> Vec<Admission> {
        let mut admissions = Vec::new();

        while self.active.len() < self.max_concurrent {
            let Some(game_id) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&game_id) else {
                continue;
            };

            let transfer_id = self.next_transfer_id;
            self.next_transfer_id += 1;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (pause_tx, pause_rx) = watch::channel(false);

            entry.task.state = DownloadState::Active;
            self.active.insert(
                game_id.clone(),
                ActiveTransfer {
                    transfer_id,
                    cancel: cancel_tx,
                    pause: pause_tx,
                },
            );
            admissions.push(Admission {
                transfer_id,
                request: entry.request.clone(),
                cancel: cancel_rx,
                pause: pause_rx,
            });

            log::info!(
                "[download] starting {} (transfer {}, {}/{} slots)",
                game_id,
                transfer_id,
                self.active.len(),
                self.max_concurrent
            );
            self.emit_state(&game_id, DownloadState::Active);
        }

        admissions
    }

    /// Cancel a queued, active or paused download. Returns whether anything
    /// was canceled, plus any transfers promoted into the freed slot.
    pub fn cancel(&mut self, game_id: &str) -> (bool, Vec<Admission>) {
        let state = match self.entries.get(game_id) {
            Some(entry) if !entry.task.state.is_terminal() => entry.task.state,
            _ => return (false, Vec::new()),
        };

        if state == DownloadState::Queued {
            self.queue.retain(|id| id != game_id);
        } else if let Some(active) = self.active.remove(game_id) {
            let _ = active.cancel.send(true);
        }

        log::info!("[download] canceled {} while {:?}", game_id, state);
        self.settle(game_id, DownloadState::Canceled, Some(DownloadError::Canceled));

        (true, self.promote())
    }

    pub fn pause(&mut self, game_id: &str) -> bool {
        self.set_paused(game_id, true)
    }

    pub fn resume(&mut self, game_id: &str) -> bool {
        self.set_paused(game_id, false)
    }

    fn set_paused(&mut self, game_id: &str, paused: bool) -> bool {
        let (from, to) = if paused {
            (DownloadState::Active, DownloadState::Paused)
        } else {
            (DownloadState::Paused, DownloadState::Active)
        };

        let Some(active) = self.active.get(game_id) else {
            return false;
        };
        match self.entries.get_mut(game_id) {
            Some(entry) if entry.task.state == from => {
                let _ = active.pause.send(paused);
                entry.task.state = to;
            }
            _ => return false,
        }

        log::info!("[download] {} {:?}", game_id, to);
        self.emit_state(game_id, to);
        true
    }

    /// Fold in a progress report. Reports from stale transfers are ignored.
    pub fn progress(
        &mut self,
        game_id: &str,
        transfer_id: u64,
        transferred: u64,
        total: Option<u64>,
    ) {
        if !self.is_current(game_id, transfer_id) {
            return;
        }
        let Some(entry) = self.entries.get_mut(game_id) else {
            return;
        };

        let previous = entry.task.percent;
        entry.task.bytes_transferred = transferred;
        entry.task.total_bytes = total;
        entry.task.percent = percent(transferred, total);

        let now = Instant::now();
        let due = match entry.last_forwarded {
            None => true,
            Some(at) => now.duration_since(at) >= self.progress_interval,
        };
        // Reaching 100 % is always forwarded
        if due || (entry.task.percent == 100 && previous != 100) {
            entry.last_forwarded = Some(now);
            let event = progress_event(&entry.task);
            self.outbox.push(event);
        }
    }

    /// Record the outcome of a transfer and promote the next queued one.
    /// Outcomes from stale transfers (e.g. after a cancel) are ignored.
    pub fn finish(
        &mut self,
        game_id: &str,
        transfer_id: u64,
        result: Result<u64, DownloadError>,
    ) -> Vec<Admission> {
        if !self.is_current(game_id, transfer_id) {
            log::debug!("[download] ignoring stale outcome for {} ({})", game_id, transfer_id);
            return Vec::new();
        }
        self.active.remove(game_id);

        match result {
            Ok(bytes) => {
                if let Some(entry) = self.entries.get_mut(game_id) {
                    let forward = entry.task.percent != 100;
                    entry.task.bytes_transferred = bytes;
                    entry.task.total_bytes = entry.task.total_bytes.or(Some(bytes));
                    entry.task.percent = 100;
                    if forward {
                        let event = progress_event(&entry.task);
                        self.outbox.push(event);
                    }
                }
                self.settle(game_id, DownloadState::Completed, None);
            }
            Err(DownloadError::Canceled) => {
                self.settle(game_id, DownloadState::Canceled, Some(DownloadError::Canceled));
            }
            Err(e) => {
                log::error!("[download] {} failed: {}", game_id, e);
                self.settle(game_id, DownloadState::Failed, Some(e));
            }
        }

        self.promote()
    }

    /// Move a task into a terminal state and resolve whoever waits on it
    fn settle(&mut self, game_id: &str, state: DownloadState, failure: Option<DownloadError>) {
        let Some(entry) = self.entries.get_mut(game_id) else {
            return;
        };
        entry.task.state = state;
        entry.task.error = match (&failure, state) {
            (Some(e), DownloadState::Failed) => Some(e.to_string()),
            _ => None,
        };
        entry.failure = failure;

        let outcome = outcome(entry);
        if let Some(waiters) = self.waiters.remove(game_id) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.emit_state(game_id, state);
    }

    /// Register interest in the terminal outcome of a download
    pub fn wait_for(&mut self, game_id: &str, reply: oneshot::Sender<DownloadOutcome>) {
        match self.entries.get(game_id) {
            None => {
                let _ = reply.send(Err(DownloadError::NotFound(game_id.to_string())));
            }
            Some(entry) if entry.task.state.is_terminal() => {
                let _ = reply.send(outcome(entry));
            }
            Some(_) => self.waiters.entry(game_id.to_string()).or_default().push(reply),
        }
    }

    /// Cancel everything that has not finished. Returns how many were canceled.
    pub fn cancel_all(&mut self) -> usize {
        let mut pending: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.task.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();

        // Drain the queue first so cancelling active ones promotes nothing
        let queued: Vec<String> = self.queue.drain(..).collect();
        for game_id in &queued {
            self.settle(game_id, DownloadState::Canceled, Some(DownloadError::Canceled));
        }
        for game_id in &pending {
            if let Some(active) = self.active.remove(game_id) {
                let _ = active.cancel.send(true);
                self.settle(game_id, DownloadState::Canceled, Some(DownloadError::Canceled));
            }
        }
        pending.len()
    }

    /// Drop a terminal record. Non-terminal tasks are kept.
    pub fn clear(&mut self, game_id: &str) -> bool {
        match self.entries.get(game_id) {
            Some(entry) if entry.task.state.is_terminal() => {
                self.entries.remove(game_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, game_id: &str) -> Option<DownloadTask> {
        self.entries.get(game_id).map(|entry| entry.task.clone())
    }

    /// All known downloads, ordered by game id
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> =
            self.entries.values().map(|entry| entry.task.clone()).collect();
        tasks.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        tasks
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Events produced since the last drain, in order
    pub fn drain_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn is_current(&self, game_id: &str, transfer_id: u64) -> bool {
        matches!(self.active.get(game_id), Some(active) if active.transfer_id == transfer_id)
    }

    fn emit_state(&mut self, game_id: &str, state: DownloadState) {
        self.outbox.push(CoreEvent::DownloadState {
            game_id: game_id.to_string(),
            state,
        });
    }
}

fn outcome(entry: &Entry) -> DownloadOutcome {
    match (&entry.failure, entry.task.state) {
        (_, DownloadState::Completed) => Ok(entry.task.clone()),
        (Some(e), _) => Err(e.clone()),
        (None, _) => Err(DownloadError::Canceled),
    }
}

fn percent(transferred: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => (transferred.saturating_mul(100) / total).min(100) as u8,
        _ => 0,
    }
}

fn progress_event(task: &DownloadTask) -> CoreEvent {
    CoreEvent::DownloadProgress {
        game_id: task.game_id.clone(),
        percent: task.percent,
        bytes_transferred: task.bytes_transferred,
        total_bytes: task.total_bytes,
    }
}
