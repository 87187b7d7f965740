use crate::config::KILN_DIR;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("could not move {from:?} to {to:?}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not copy {from:?} to {to:?} across devices: {message}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        message: String,
    },

    #[error("could not prepare {path:?}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{failure}; restoring the previous install also failed: {restore}")]
    Restore {
        failure: Box<SwapError>,
        restore: Box<SwapError>,
    },
}

impl SwapError {
    fn prepare(path: &Path, source: io::Error) -> Self {
        Self::Prepare {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// InstallSwap replaces a game's live install dir with a fully staged one.
///
/// The live dir is moved to a backup, staging is moved into place, and only
/// then is the backup dropped. If staging cannot be moved in, the backup is
/// moved back, so the previous install survives any failure.
pub struct InstallSwap {
    game_id: String,
    live_dir: PathBuf,
    backup_dir: PathBuf,
}

impl InstallSwap {
    pub fn new(game_id: &str, install_root: &Path) -> Self {
        Self {
            game_id: game_id.to_string(),
            live_dir: install_root.join(game_id),
            backup_dir: install_root.join(KILN_DIR).join("backups").join(game_id),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    pub fn apply(&self, staging: &Path) -> Result<(), SwapError> {
        let had_install = self.set_aside()?;

        if let Err(failure) = self.relocate(staging, &self.live_dir) {
            log::warn!("[txn:{}] rolling back: {}", self.game_id, failure);
            if let Err(restore) = self.restore(had_install) {
                log::error!("[txn:{}] rollback failed: {}", self.game_id, restore);
                return Err(SwapError::Restore {
                    failure: Box::new(failure),
                    restore: Box::new(restore),
                });
            }
            return Err(failure);
        }

        self.drop_backup();
        log::info!("[txn:{}] new install is live", self.game_id);
        Ok(())
    }

    /// Take the live install away. The dir leaves the live path in one
    /// rename, so a launch can never see it half deleted. `false` if there
    /// was nothing installed.
    pub fn remove(&self) -> Result<bool, SwapError> {
        if !self.set_aside()? {
            return Ok(false);
        }
        self.drop_backup();
        log::info!("[txn:{}] install removed", self.game_id);
        Ok(true)
    }

    /// Move the live install into the backup slot, replacing any leftover
    /// backup. Returns whether there was a live install.
    fn set_aside(&self) -> Result<bool, SwapError> {
        if !self.live_dir.exists() {
            if let Some(parent) = self.live_dir.parent() {
                fs::create_dir_all(parent).map_err(|e| SwapError::prepare(parent, e))?;
            }
            return Ok(false);
        }

        if let Some(parent) = self.backup_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| SwapError::prepare(parent, e))?;
        }
        if self.backup_dir.exists() {
            log::debug!("[txn:{}] clearing leftover backup", self.game_id);
            fs::remove_dir_all(&self.backup_dir)
                .map_err(|e| SwapError::prepare(&self.backup_dir, e))?;
        }
        self.relocate(&self.live_dir, &self.backup_dir)?;
        Ok(true)
    }

    fn restore(&self, had_install: bool) -> Result<(), SwapError> {
        if self.live_dir.exists() {
            fs::remove_dir_all(&self.live_dir)
                .map_err(|e| SwapError::prepare(&self.live_dir, e))?;
        }
        if had_install {
            self.relocate(&self.backup_dir, &self.live_dir)?;
        }
        Ok(())
    }

    // Whatever is live now stays live; a leftover backup only costs disk
    fn drop_backup(&self) {
        if !self.backup_dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.backup_dir) {
            log::warn!(
                "[txn:{}] failed to remove backup {:?}: {}",
                self.game_id,
                self.backup_dir,
                e
            );
        }
    }

    /// Rename `from` to `to`, falling back to copy and delete when they sit
    /// on different filesystems.
    fn relocate(&self, from: &Path, to: &Path) -> Result<(), SwapError> {
        let err = match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !crosses_devices(&err) {
            return Err(SwapError::Move {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source: err,
            });
        }

        log::info!(
            "[txn:{}] {:?} is on another filesystem, copying instead",
            self.game_id,
            from
        );
        let copy_failed = |message: String| SwapError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            message,
        };
        for entry in WalkDir::new(from) {
            let entry = entry.map_err(|e| copy_failed(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(from)
                .map_err(|e| copy_failed(e.to_string()))?;
            let target = to.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| copy_failed(e.to_string()))?;
            } else {
                fs::copy(entry.path(), &target).map_err(|e| {
                    copy_failed(format!("{:?}: {}", entry.path(), e))
                })?;
            }
        }
        fs::remove_dir_all(from).map_err(|e| SwapError::prepare(from, e))
    }
}

#[cfg(unix)]
fn crosses_devices(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}

#[cfg(not(unix))]
fn crosses_devices(_err: &io::Error) -> bool {
    false
}
