/// Locating a game's executable inside its install directory
use std::path::{Path, PathBuf};

/// Picks the executable to launch when the caller does not name one
pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, install_dir: &Path, game_id: &str) -> Option<PathBuf>;
}

// Shipped next to the game but never the thing to launch
const IGNORED_STEMS: &[&str] = &[
    "unitycrashhandler64",
    "unitycrashhandler32",
    "crashreportclient",
    "uninstall",
    "unins000",
];

/// Scans the top level of the install dir.
///
/// A single candidate wins outright. With several, the one whose file stem
/// matches the game id (ignoring case) wins; otherwise the choice is ambiguous
/// and nothing is returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferredExecutableResolver;

impl ExecutableResolver for PreferredExecutableResolver {
    fn resolve(&self, install_dir: &Path, game_id: &str) -> Option<PathBuf> {
        let entries = match std::fs::read_dir(install_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("[launch] cannot scan {:?}: {}", install_dir, e);
                return None;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_executable(path) && !is_ignored(path))
            .collect();
        candidates.sort();

        if candidates.len() == 1 {
            return candidates.pop();
        }

        let wanted = game_id.to_lowercase();
        let found = candidates.into_iter().find(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().to_lowercase() == wanted)
                .unwrap_or(false)
        });
        if found.is_none() {
            log::debug!("[launch] no unambiguous executable for {} in {:?}", game_id, install_dir);
        }
        found
    }
}

fn is_ignored(path: &Path) -> bool {
    path.file_stem()
        .map(|stem| {
            let stem = stem.to_string_lossy().to_lowercase();
            IGNORED_STEMS.contains(&stem.as_str())
        })
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn is_executable(_path: &Path) -> bool {
    false
}
