pub mod downloader;
pub mod transfer;
pub mod types;

pub use downloader::{Admission, DownloadCoordinator, DownloadOutcome};
pub use transfer::{part_path, HttpTransport};
pub use types::{
    DownloadRequest, DownloadState, DownloadTask, ProgressFn, TransferControl, Transport,
};
