pub mod installer;
pub mod launcher;
pub mod library;
pub mod playtime;
pub mod updater;

// Re-export commonly used types
pub use installer::{DownloadRequest, DownloadState, DownloadTask};
pub use launcher::{CloseDecision, LaunchRequest, RunningGame, StopOutcome};
pub use library::InstalledGame;
pub use playtime::PlaytimeTotal;
pub use updater::{UpdateCheck, UpdateRun, UpdateStatus, UpdateStep};
