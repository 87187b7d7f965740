/// Registry of running games, keyed by game id
///
/// The registry is the single source of truth for "is this game running". It
/// is owned by the launcher runtime and mutated only from its control flow.
/// Every mutation is mirrored to a small JSON state file so a later session
/// can rediscover games that outlived this one.
use crate::error::ReconciliationWarning;
use crate::game::launcher::types::{GameProcess, RunningGame, RunningProcessRecord};
use crate::utils::{Liveness, ProcessIdentity};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct ProcessRegistry {
    /// Map of game_id -> GameProcess
    processes: HashMap<String, GameProcess>,

    /// Where records are mirrored. `None` keeps the registry in memory only.
    state_file: Option<PathBuf>,
}

impl ProcessRegistry {
    pub fn new(state_file: Option<PathBuf>) -> Self {
        Self {
            processes: HashMap::new(),
            state_file,
        }
    }

    /// In-memory registry with no state file
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Register a running game. A second entry for the same game id is
    /// rejected and handed back untouched.
    pub fn insert(&mut self, process: GameProcess) -> Result<(), GameProcess> {
        if self.processes.contains_key(&process.game_id) {
            return Err(process);
        }

        log::info!(
            "Registering game: {} (PID {}, generation {})",
            process.game_id,
            process.pid,
            process.generation
        );
        self.processes.insert(process.game_id.clone(), process);
        self.persist();
        Ok(())
    }

    pub fn get(&self, game_id: &str) -> Option<&GameProcess> {
        self.processes.get(game_id)
    }

    pub fn is_running(&self, game_id: &str) -> bool {
        self.processes.contains_key(game_id)
    }

    /// Remove the entry only if it still belongs to `generation`. A completion
    /// from an older launch of the same game leaves the newer entry alone.
    pub fn remove_generation(&mut self, game_id: &str, generation: u64) -> Option<GameProcess> {
        match self.processes.get(game_id) {
            Some(process) if process.generation == generation => {}
            _ => return None,
        }

        let removed = self.processes.remove(game_id);
        if let Some(process) = &removed {
            log::info!("Unregistering game: {} (PID {})", game_id, process.pid);
            self.persist();
        }
        removed
    }

    /// All running games, ordered by game id
    pub fn snapshot(&self) -> Vec<RunningGame> {
        let mut games: Vec<RunningGame> = self.processes.values().map(RunningGame::from).collect();
        games.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        games
    }

    pub fn game_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Mirror the current entries to the state file. Failures are logged; the
    /// in-memory registry stays authoritative.
    pub fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };

        let mut records: Vec<RunningProcessRecord> = self
            .processes
            .values()
            .map(RunningProcessRecord::from)
            .collect();
        records.sort_by(|a, b| a.game_id.cmp(&b.game_id));

        if let Err(e) = save_records(path, &records) {
            log::warn!("Failed to persist running processes to {:?}: {:#}", path, e);
        }
    }
}

/// Load persisted records. A missing file means nothing was running.
pub fn load_records(path: &Path) -> Result<Vec<RunningProcessRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read running processes file {:?}", path))?;
    serde_json::from_str(&data).context("Failed to parse running processes JSON")
}

fn save_records(path: &Path, records: &[RunningProcessRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state dir {:?}", parent))?;
    }

    let data =
        serde_json::to_string_pretty(records).context("Failed to serialize running processes")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).context("Failed to write running processes file")?;
    std::fs::rename(&tmp, path).context("Failed to replace running processes file")?;
    Ok(())
}

/// Split persisted records into survivors and stale entries.
///
/// A live pid is only kept when it is still the process that was recorded:
/// its start time (and executable, when readable) must match. A pid reused by
/// something else is dropped, never adopted. `Unknown` liveness is kept if the
/// identity checks out. Only the first record per game id is considered.
pub fn reconcile_records<P, I>(
    records: Vec<RunningProcessRecord>,
    mut liveness: P,
    mut identify: I,
) -> (Vec<RunningProcessRecord>, Vec<ReconciliationWarning>)
where
    P: FnMut(u32) -> Liveness,
    I: FnMut(u32) -> Option<ProcessIdentity>,
{
    let mut seen = HashSet::new();
    let mut alive = Vec::new();
    let mut warnings = Vec::new();

    for record in records {
        if !seen.insert(record.game_id.clone()) {
            warnings.push(stale(record, "duplicate record for game"));
            continue;
        }

        if liveness(record.pid) == Liveness::Dead {
            warnings.push(stale(record, "process no longer exists"));
            continue;
        }

        let reason = match (&record.identity, identify(record.pid)) {
            (None, _) => Some("record has no process identity"),
            (Some(_), None) => Some("process identity could not be read"),
            (Some(recorded), Some(current)) if !recorded.matches(&current) => {
                Some("pid now belongs to a different process")
            }
            _ => None,
        };
        match reason {
            Some(reason) => warnings.push(stale(record, reason)),
            None => alive.push(record),
        }
    }

    (alive, warnings)
}

fn stale(record: RunningProcessRecord, reason: &str) -> ReconciliationWarning {
    ReconciliationWarning {
        game_id: record.game_id,
        pid: record.pid,
        reason: reason.to_string(),
    }
}
