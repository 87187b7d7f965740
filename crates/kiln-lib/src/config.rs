//! Runtime tunables for the launcher core.
//! User-facing settings live in [`crate::settings`]; these are the knobs a host
//! sets once when constructing the runtime.

use std::path::PathBuf;
use std::time::Duration;

/// Grace period between the graceful signal and the liveness re-check
pub const WATCHDOG_TIMEOUT_MS: u64 = 1000;

/// How many times an `unknown` liveness check re-arms the watchdog before escalating
pub const LIVENESS_RECHECK_LIMIT: u32 = 3;

/// Poll interval for processes adopted at reconciliation (no child handle)
pub const ADOPTED_POLL_SECS: u64 = 5;

// Progress forwarding throttle, per download
pub const PROGRESS_INTERVAL_MS: u64 = 250;

pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Name of the running-process state file
pub const PROCESS_STATE_FILENAME: &str = "running_processes.json";

/// Launcher-private directory under the install root (downloads, staging, backups)
pub const KILN_DIR: &str = ".kiln";

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub watchdog_timeout: Duration,
    pub liveness_recheck_limit: u32,
    pub adopted_poll_interval: Duration,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    /// Where running processes are mirrored for reconciliation. `None`
    /// disables persistence (and with it, reconciliation).
    pub state_file: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_millis(WATCHDOG_TIMEOUT_MS),
            liveness_recheck_limit: LIVENESS_RECHECK_LIMIT,
            adopted_poll_interval: Duration::from_secs(ADOPTED_POLL_SECS),
            progress_interval: Duration::from_millis(PROGRESS_INTERVAL_MS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            state_file: Some(crate::settings::default_data_dir().join(PROCESS_STATE_FILENAME)),
        }
    }
}

impl LauncherConfig {
    pub fn with_state_file(mut self, path: Option<PathBuf>) -> Self {
        self.state_file = path;
        self
    }

    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }
}
