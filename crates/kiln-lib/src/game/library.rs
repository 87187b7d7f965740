//! What is installed under the install root, and how much disk it takes.
//!
//! Every game lives in `install_root/<game id>`, so a game id doubles as a
//! directory name and must stay a single plain path component.

use crate::config::KILN_DIR;
use crate::settings::SettingsStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// A game id can be joined onto the install root without leaving it
pub fn is_valid_game_id(game_id: &str) -> bool {
    if game_id.is_empty() || game_id == KILN_DIR {
        return false;
    }
    if game_id.contains(['/', '\\', ':', '\0']) {
        return false;
    }
    let mut components = Path::new(game_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledGame {
    pub game_id: String,
    pub install_dir: PathBuf,
    /// Recorded by the last successful update, if any
    pub version: Option<String>,
    pub size_bytes: u64,
}

/// Every game directory under the install root, sorted by id. Hidden dirs
/// (including the launcher's own scratch dir) are skipped.
pub fn installed_games(settings: &dyn SettingsStore) -> Result<Vec<InstalledGame>> {
    let root = settings.install_root();
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut games = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list install root {:?}", root))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(game_id) = entry.file_name().to_str() else {
            log::debug!("[library] skipping non UTF-8 dir {:?}", entry.path());
            continue;
        };
        if game_id.starts_with('.') || !is_valid_game_id(game_id) {
            continue;
        }

        games.push(InstalledGame {
            game_id: game_id.to_string(),
            install_dir: entry.path().to_path_buf(),
            version: settings.installed_version(game_id),
            size_bytes: dir_size(entry.path()),
        });
    }
    games.sort_by(|a, b| a.game_id.cmp(&b.game_id));
    Ok(games)
}

/// Size of one game's install dir. `None` when it is not installed.
pub fn game_size(settings: &dyn SettingsStore, game_id: &str) -> Option<u64> {
    if !is_valid_game_id(game_id) {
        return None;
    }
    let dir = settings.install_root().join(game_id);
    dir.is_dir().then(|| dir_size(&dir))
}

/// Total size of the regular files below `dir`. Symlinks are not followed
/// and unreadable entries are skipped.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
