//! Settings store boundary.
//!
//! The core reads `max_concurrent_downloads` and `install_root`, and writes
//! only two kinds of records: playtime totals and installed versions. Anything
//! else in the settings file belongs to the host and is left untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub trait SettingsStore: Send + Sync {
    fn max_concurrent_downloads(&self) -> usize;

    fn install_root(&self) -> PathBuf;

    /// Persisted playtime total in seconds (0 if never played)
    fn playtime_seconds(&self, game_id: &str) -> u64;

    fn set_playtime_seconds(&self, game_id: &str, seconds: u64) -> Result<()>;

    fn installed_version(&self, game_id: &str) -> Option<String>;

    fn set_installed_version(&self, game_id: &str, version: &str) -> Result<()>;

    /// Forget the installed version, after the game was uninstalled
    fn clear_installed_version(&self, game_id: &str) -> Result<()>;
}

/// Platform data directory for the launcher
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "Kiln")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".kiln"))
}

/// On-disk settings document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherSettings {
    pub max_concurrent_downloads: usize,
    pub install_root: PathBuf,
    pub playtime: BTreeMap<String, u64>,
    pub installed_versions: BTreeMap<String, String>,

    /// Host-owned keys, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            install_root: default_data_dir().join("games"),
            playtime: BTreeMap::new(),
            installed_versions: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// JSON file backed [`SettingsStore`]
pub struct JsonSettingsStore {
    path: PathBuf,
    settings: Mutex<LauncherSettings>,
}

impl JsonSettingsStore {
    /// Load settings from `path`, falling back to defaults if the file is missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings file {:?}", path))?;
            serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse settings file {:?}", path))?
        } else {
            log::info!("No settings file at {:?}, using defaults", path);
            LauncherSettings::default()
        };

        Ok(Self {
            path,
            settings: Mutex::new(settings),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_data_dir().join("settings.json"))
    }

    /// Store seeded with explicit settings; nothing is written until the core
    /// records playtime or a version
    pub fn with_settings(path: impl Into<PathBuf>, settings: LauncherSettings) -> Self {
        Self {
            path: path.into(),
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> LauncherSettings {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherSettings> {
        self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, apply: impl FnOnce(&mut LauncherSettings)) -> Result<()> {
        let mut settings = self.lock();
        apply(&mut settings);
        save(&self.path, &settings)
    }
}

fn save(path: &Path, settings: &LauncherSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings dir {:?}", parent))?;
    }
    let data = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

    // Write-then-rename so a crash mid-write never truncates the settings file
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

impl SettingsStore for JsonSettingsStore {
    fn max_concurrent_downloads(&self) -> usize {
        self.lock().max_concurrent_downloads.max(1)
    }

    fn install_root(&self) -> PathBuf {
        self.lock().install_root.clone()
    }

    fn playtime_seconds(&self, game_id: &str) -> u64 {
        self.lock().playtime.get(game_id).copied().unwrap_or(0)
    }

    fn set_playtime_seconds(&self, game_id: &str, seconds: u64) -> Result<()> {
        self.update(|s| {
            s.playtime.insert(game_id.to_string(), seconds);
        })
    }

    fn installed_version(&self, game_id: &str) -> Option<String> {
        self.lock().installed_versions.get(game_id).cloned()
    }

    fn set_installed_version(&self, game_id: &str, version: &str) -> Result<()> {
        self.update(|s| {
            s.installed_versions
                .insert(game_id.to_string(), version.to_string());
        })
    }

    fn clear_installed_version(&self, game_id: &str) -> Result<()> {
        self.update(|s| {
            s.installed_versions.remove(game_id);
        })
    }
}
