//! Remote version lookup
use crate::error::UpdateCheckError;
use crate::game::updater::types::RemoteRelease;
use futures::future::BoxFuture;
use reqwest::Client;
use std::time::Duration;
use url::Url;

pub trait RemoteVersionService: Send + Sync {
    /// Latest published release of `game_id`
    fn latest_release<'a>(
        &'a self,
        game_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRelease, UpdateCheckError>>;
}

/// Fetches `<base>/games/<game_id>/latest.json`
#[derive(Clone)]
pub struct HttpVersionService {
    client: Client,
    base_url: Url,
}

impl HttpVersionService {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, UpdateCheckError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, UpdateCheckError> {
        // A trailing slash keeps Url::join from dropping the last path segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| {
            UpdateCheckError::InvalidResponse(format!("invalid base url {}: {}", base_url, e))
        })?;
        Ok(Self { client, base_url })
    }

    fn release_url(&self, game_id: &str) -> Result<Url, UpdateCheckError> {
        self.base_url
            .join(&format!("games/{}/latest.json", game_id))
            .map_err(|e| {
                UpdateCheckError::InvalidResponse(format!("invalid game id {}: {}", game_id, e))
            })
    }
}

impl RemoteVersionService for HttpVersionService {
    fn latest_release<'a>(
        &'a self,
        game_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRelease, UpdateCheckError>> {
        Box::pin(async move {
            let url = self.release_url(game_id)?;
            log::debug!("[update:{}] fetching {}", game_id, url);

            let response = self.client.get(url.clone()).send().await?;
            if !response.status().is_success() {
                return Err(UpdateCheckError::Remote(format!(
                    "HTTP error {}: {}",
                    response.status(),
                    url
                )));
            }

            let release: RemoteRelease = response.json().await?;
            if release.version.trim().is_empty() {
                return Err(UpdateCheckError::InvalidResponse(
                    "release has an empty version".to_string(),
                ));
            }
            Ok(release)
        })
    }
}
