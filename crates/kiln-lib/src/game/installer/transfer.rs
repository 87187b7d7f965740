//! HTTP transfer of a single file.
//!
//! Bytes stream into `<dest>.<transfer>.part`, which is flushed, fsynced and
//! only then renamed over the destination, so an interrupted transfer never
//! leaves a truncated file at the final path. The transfer id in the name
//! keeps a canceled transfer's cleanup away from a newer transfer to the same
//! destination.

use crate::error::DownloadError;
use crate::game::installer::types::{DownloadRequest, TransferControl, Transport};
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;

/// Temp path transfer `transfer_id` writes to before the final rename
pub fn part_path(path: &Path, transfer_id: u64) -> PathBuf {
    let tmp_name = format!(
        "{}.{}.part",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download"),
        transfer_id
    );
    path.with_file_name(tmp_name)
}

/// [`Transport`] over `reqwest` streaming
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn transfer(
        &self,
        request: &DownloadRequest,
        control: &TransferControl,
    ) -> Result<u64, DownloadError> {
        let path = &request.destination;
        let url = url::Url::parse(&request.url)
            .map_err(|e| DownloadError::Network(format!("invalid url {}: {}", request.url, e)))?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let total_size = response.content_length();
        log::debug!("[download] {} size: {:?} bytes", request.game_id, total_size);

        let tmp_path = part_path(path, control.transfer_id());
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| DownloadError::io(&tmp_path, e))?;
        let mut downloaded: u64 = 0;
        let mut hasher = Sha256::new();
        control.update_bytes(0, total_size);

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            // Handle pause
            control.wait_while_paused().await?;

            let chunk = chunk_result?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(&tmp_path, e))?;
            hasher.update(&chunk);

            downloaded += chunk.len() as u64;
            control.update_bytes(downloaded, total_size);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(&tmp_path, e))?;
        // Ensure data is on disk before the rename makes it visible
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(&tmp_path, e))?;
        drop(file);

        if let Some(expected) = total_size {
            if downloaded < expected {
                return Err(DownloadError::Interrupted(format!(
                    "received {} of {} bytes",
                    downloaded, expected
                )));
            }
        }

        if let Some(expected) = &request.expected_sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                // Delete invalid temp file
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(DownloadError::Checksum {
                    expected: expected.clone(),
                    actual,
                });
            }
            log::debug!("[download] sha256 validated: {}", actual);
        }

        // Atomic move into place
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;

        let secs = start.elapsed().as_secs_f64();
        log::info!(
            "[download] {} done: size={} bytes, time={:.2}s, throughput={:.2} MB/s",
            request.game_id,
            downloaded,
            secs,
            (downloaded as f64 / 1024.0 / 1024.0) / secs.max(0.001)
        );
        Ok(downloaded)
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(
        &'a self,
        request: &'a DownloadRequest,
        control: TransferControl,
    ) -> BoxFuture<'a, Result<u64, DownloadError>> {
        Box::pin(async move {
            log::debug!("[download] {} -> {:?}", request.url, request.destination);

            let result = tokio::select! {
                result = self.transfer(request, &control) => result,
                _ = control.cancelled() => Err(DownloadError::Canceled),
            };

            let tmp_path = part_path(&request.destination, control.transfer_id());
            match &result {
                Ok(_) => {}
                Err(DownloadError::Canceled) => {
                    log::info!("[download] {} canceled", request.game_id);
                    if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("[download] failed to remove {:?}: {}", tmp_path, e);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[download] {} failed: {} (partial file kept at {:?})",
                        request.game_id,
                        e,
                        tmp_path
                    );
                }
            }
            result
        })
    }
}
