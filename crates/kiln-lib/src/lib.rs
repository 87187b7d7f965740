//! Kiln launcher core: game process lifecycle, playtime, downloads and
//! updates, driven by a single runtime task.

pub mod config;
pub mod error;
pub mod game;
pub mod notify;
pub mod runtime;
pub mod settings;
pub mod utils;

pub use config::LauncherConfig;
pub use notify::{CoreEvent, EventNotifier, NotificationSink};
pub use runtime::{Launcher, LauncherBuilder};
pub use settings::{JsonSettingsStore, SettingsStore};
