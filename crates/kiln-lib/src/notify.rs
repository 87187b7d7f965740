//! Outward event and notification boundary.
//!
//! The core never waits on the UI: sinks are called synchronously from the
//! control flow, so implementations must return immediately. A panicking sink
//! is isolated and logged.

use crate::game::installer::DownloadState;
use crate::game::updater::UpdateStep;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by the core at its outward boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum CoreEvent {
    GameStarted {
        game_id: String,
    },
    GameStopped {
        game_id: String,
    },
    DownloadProgress {
        game_id: String,
        percent: u8,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    DownloadState {
        game_id: String,
        state: DownloadState,
    },
    UpdateStep {
        game_id: String,
        step: UpdateStep,
    },
    UpdateFailed {
        game_id: String,
        reason: String,
    },
    GameUninstalled {
        game_id: String,
    },
}

impl CoreEvent {
    /// Wire name of the event, as seen by the UI
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::GameStarted { .. } => "game-started",
            CoreEvent::GameStopped { .. } => "game-stopped",
            CoreEvent::DownloadProgress { .. } => "download-progress",
            CoreEvent::DownloadState { .. } => "download-state",
            CoreEvent::UpdateStep { .. } => "update-step",
            CoreEvent::UpdateFailed { .. } => "update-failed",
            CoreEvent::GameUninstalled { .. } => "game-uninstalled",
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            CoreEvent::GameStarted { game_id }
            | CoreEvent::GameStopped { game_id }
            | CoreEvent::DownloadProgress { game_id, .. }
            | CoreEvent::DownloadState { game_id, .. }
            | CoreEvent::UpdateStep { game_id, .. }
            | CoreEvent::UpdateFailed { game_id, .. }
            | CoreEvent::GameUninstalled { game_id } => game_id,
        }
    }
}

/// UI-side receiver of core output
pub trait NotificationSink: Send + Sync {
    /// Show a user-facing notification
    fn push(&self, title: &str, body: &str);

    /// Deliver a state event
    fn emit(&self, event: &CoreEvent);
}

/// Message forwarded by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum UiMessage {
    Event(CoreEvent),
    Notification { title: String, body: String },
}

/// Sink that forwards everything into an unbounded channel. Sends to a closed
/// channel are dropped, so a missing UI never affects the core.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<UiMessage>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn push(&self, title: &str, body: &str) {
        let _ = self.tx.send(UiMessage::Notification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    fn emit(&self, event: &CoreEvent) {
        let _ = self.tx.send(UiMessage::Event(event.clone()));
    }
}

/// Fire-and-forget front for an optional [`NotificationSink`]
#[derive(Clone, Default)]
pub struct EventNotifier {
    sink: Option<Arc<dyn NotificationSink>>,
}

impl EventNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Notifier with no UI attached
    pub fn silent() -> Self {
        Self::default()
    }

    /// Notifier backed by a [`ChannelSink`], plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(ChannelSink::new(tx))), rx)
    }

    pub fn emit(&self, event: CoreEvent) {
        log::debug!("[notify] {} ({})", event.name(), event.game_id());
        if let Some(sink) = &self.sink {
            if catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
                log::error!("[notify] sink panicked while emitting {}", event.name());
            }
        }
    }

    pub fn push(&self, title: &str, body: &str) {
        log::info!("[notify] {}: {}", title, body);
        if let Some(sink) = &self.sink {
            if catch_unwind(AssertUnwindSafe(|| sink.push(title, body))).is_err() {
                log::error!("[notify] sink panicked while pushing '{}'", title);
            }
        }
    }
}
