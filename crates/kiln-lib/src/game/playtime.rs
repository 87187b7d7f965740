//! Per-game playtime tracking.
//!
//! Sessions are measured on the monotonic clock and merged into the persisted
//! total when they close.

use crate::settings::SettingsStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// An open play session
#[derive(Debug, Clone)]
pub struct PlaytimeSession {
    pub game_id: String,
    /// Wall-clock start, for display
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl PlaytimeSession {
    pub fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Persisted total plus any in-progress session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaytimeTotal {
    pub game_id: String,
    pub seconds: u64,
    /// "45s", "12m", "3h 05m"
    pub formatted: String,
    pub in_session: bool,
}

pub struct PlaytimeTracker {
    sessions: HashMap<String, PlaytimeSession>,
    store: Arc<dyn SettingsStore>,
}

impl PlaytimeTracker {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            sessions: HashMap::new(),
            store,
        }
    }

    /// Open a session. Returns `false` (and changes nothing) if one is already
    /// active for this game.
    pub fn start(&mut self, game_id: &str) -> bool {
        if self.sessions.contains_key(game_id) {
            log::debug!("[playtime] session for {} already active", game_id);
            return false;
        }

        self.sessions.insert(
            game_id.to_string(),
            PlaytimeSession {
                game_id: game_id.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        log::debug!("[playtime] started session for {}", game_id);
        true
    }

    /// Close the session and merge it into the persisted total.
    ///
    /// Returns the seconds added, or `None` if no session was active. The
    /// session is cleared even when persisting fails.
    pub fn stop(&mut self, game_id: &str) -> Option<u64> {
        let session = self.sessions.remove(game_id)?;
        let elapsed = session.elapsed_seconds();
        let total = self.store.playtime_seconds(game_id).saturating_add(elapsed);

        if let Err(e) = self.store.set_playtime_seconds(game_id, total) {
            log::error!("[playtime] failed to persist playtime for {}: {:#}", game_id, e);
        } else {
            log::info!(
                "[playtime] {} played {}s (total {})",
                game_id,
                elapsed,
                format_duration(total)
            );
        }
        Some(elapsed)
    }

    pub fn total(&self, game_id: &str) -> PlaytimeTotal {
        let session = self.sessions.get(game_id);
        let seconds = self
            .store
            .playtime_seconds(game_id)
            .saturating_add(session.map(PlaytimeSession::elapsed_seconds).unwrap_or(0));

        PlaytimeTotal {
            game_id: game_id.to_string(),
            seconds,
            formatted: format_duration(seconds),
            in_session: session.is_some(),
        }
    }

    pub fn is_active(&self, game_id: &str) -> bool {
        self.sessions.contains_key(game_id)
    }
}

/// Human-readable playtime: seconds under a minute, minutes under an hour,
/// then hours with zero-padded minutes
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
