use serde::{Deserialize, Serialize};
use std::fmt;

/// Step of an update job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStep {
    Checking,
    Downloading,
    Extracting,
    Applying,
    Done,
    Failed,
}

impl UpdateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStep::Checking => "checking",
            UpdateStep::Downloading => "downloading",
            UpdateStep::Extracting => "extracting",
            UpdateStep::Applying => "applying",
            UpdateStep::Done => "done",
            UpdateStep::Failed => "failed",
        }
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest build published for a game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRelease {
    pub version: String,
    pub archive_url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Result of comparing the installed version with the remote one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub game_id: String,
    pub installed: Option<String>,
    pub latest: String,
    pub update_available: bool,
}

/// An in-flight update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateJob {
    pub game_id: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub step: UpdateStep,
}

/// Current or last known update status of a game
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "status",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum UpdateStatus {
    Idle,
    InProgress {
        step: UpdateStep,
        from_version: Option<String>,
        to_version: Option<String>,
    },
    UpToDate {
        version: Option<String>,
    },
    Done {
        version: String,
    },
    Failed {
        step: UpdateStep,
        cause: String,
    },
}

impl UpdateStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, UpdateStatus::InProgress { .. })
    }
}

impl From<&UpdateJob> for UpdateStatus {
    fn from(job: &UpdateJob) -> Self {
        UpdateStatus::InProgress {
            step: job.step,
            from_version: job.from_version.clone(),
            to_version: job.to_version.clone(),
        }
    }
}

/// Answer to a run request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "run", content = "status", rename_all = "kebab-case")]
pub enum UpdateRun {
    /// A new job was created
    Started(UpdateStatus),
    /// A job was already in flight; nothing new was created
    Rejected(UpdateStatus),
}

/// Successful end of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: Option<String> },
    Done { version: String },
}
