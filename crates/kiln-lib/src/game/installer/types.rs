use crate::error::DownloadError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Canceled
        )
    }
}

/// What the caller asks to be downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub game_id: String,
    pub url: String,
    pub destination: PathBuf,

    /// Hex sha256 the finished file must match
    pub expected_sha256: Option<String>,
}

impl DownloadRequest {
    pub fn new(
        game_id: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            url: url.into(),
            destination: destination.into(),
            expected_sha256: None,
        }
    }

    pub fn with_sha256(mut self, digest: Option<String>) -> Self {
        self.expected_sha256 = digest;
        self
    }
}

/// Snapshot of a download, as shown to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub game_id: String,
    pub url: String,
    pub destination: PathBuf,
    pub state: DownloadState,
    pub percent: u8,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
}

impl DownloadTask {
    pub(crate) fn queued(request: &DownloadRequest) -> Self {
        Self {
            game_id: request.game_id.clone(),
            url: request.url.clone(),
            destination: request.destination.clone(),
            state: DownloadState::Queued,
            percent: 0,
            bytes_transferred: 0,
            total_bytes: None,
            error: None,
        }
    }
}

/// Progress callback: (bytes transferred, total if known)
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Cooperative controls handed to a transport for a single transfer
#[derive(Clone)]
pub struct TransferControl {
    transfer_id: u64,
    cancel: watch::Receiver<bool>,
    pause: watch::Receiver<bool>,
    progress: ProgressFn,
}

impl TransferControl {
    pub fn new(
        transfer_id: u64,
        cancel: watch::Receiver<bool>,
        pause: watch::Receiver<bool>,
        progress: ProgressFn,
    ) -> Self {
        Self {
            transfer_id,
            cancel,
            pause,
            progress,
        }
    }

    /// Control that is never cancelled or paused. Its transfer id is 0.
    pub fn detached(progress: ProgressFn) -> Self {
        let (_, cancel) = watch::channel(false);
        let (_, pause) = watch::channel(false);
        Self::new(0, cancel, pause, progress)
    }

    /// Distinguishes this transfer's files from any other transfer to the
    /// same destination
    pub fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    pub fn update_bytes(&self, transferred: u64, total: Option<u64>) {
        (self.progress)(transferred, total);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// coordinator side is gone without cancelling.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Idle while paused. Fails with `Canceled` if cancelled meanwhile.
    pub async fn wait_while_paused(&self) -> Result<(), DownloadError> {
        let mut pause = self.pause.clone();
        while *pause.borrow_and_update() {
            tokio::select! {
                changed = pause.changed() => {
                    if changed.is_err() {
                        return Err(DownloadError::Canceled);
                    }
                }
                _ = self.cancelled() => return Err(DownloadError::Canceled),
            }
        }
        if self.is_cancelled() {
            return Err(DownloadError::Canceled);
        }
        Ok(())
    }
}

/// Moves the bytes of one request onto disk
pub trait Transport: Send + Sync {
    /// Fetch `request.url` into `request.destination`. Returns the byte count.
    fn fetch<'a>(
        &'a self,
        request: &'a DownloadRequest,
        control: TransferControl,
    ) -> BoxFuture<'a, Result<u64, DownloadError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn state_classification() {
        assert!(DownloadState::Canceled.is_terminal());
        assert!(!DownloadState::Active.is_terminal());
        assert_eq!(
            serde_json::to_string(&DownloadState::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn pause_gate_releases_on_resume_and_fails_on_cancel() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(true);
        let control = TransferControl::new(
            1,
            cancel_rx,
            pause_rx,
            Arc::new(|_: u64, _: Option<u64>| {}),
        );

        let mut gate = task::spawn(control.wait_while_paused());
        assert_pending!(gate.poll());
        pause_tx.send(false).unwrap();
        assert!(gate.is_woken());
        assert_ready_eq!(gate.poll(), Ok(()));
        drop(gate);

        pause_tx.send(true).unwrap();
        let mut gate = task::spawn(control.wait_while_paused());
        assert_pending!(gate.poll());
        cancel_tx.send(true).unwrap();
        assert_ready_eq!(gate.poll(), Err(DownloadError::Canceled));
    }
}
