//! Cover art downloads from a Subsonic-compatible media server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use tracing::{debug, trace};

use crate::domain::entities::ArtworkEntity;
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ArtworkFetchPort;
use crate::infrastructure::config::ServerConfig;

const COVER_ART_PATH: &str = "rest/getCoverArt.view";
const PING_PATH: &str = "rest/ping.view";

/// Fetches cover art over HTTP.
pub struct MediaServerFetcher {
    client: reqwest::Client,
    base: Url,
    auth: Vec<(&'static str, String)>,
}

impl std::fmt::Debug for MediaServerFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaServerFetcher")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl MediaServerFetcher {
    /// Creates a fetcher for the server in `config`.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &ServerConfig) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .build()
            .map_err(|e| CacheError::network(format!("Failed to create HTTP client: {e}")))?;
        Self::with_client(client, config)
    }

    /// Creates a fetcher that shares an existing client.
    ///
    /// # Errors
    /// Returns error if the configured URL is invalid.
    pub fn with_client(client: reqwest::Client, config: &ServerConfig) -> CacheResult<Self> {
        // A trailing slash keeps the last path segment when joining.
        let mut raw = config.url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|e| {
            CacheError::invalid_request(format!("invalid server url {:?}: {e}", config.url))
        })?;

        Ok(Self {
            client,
            base,
            auth: auth_params(config),
        })
    }

    /// Returns the HTTP client.
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// URL for the cover art of `entity` scaled to `size`.
    ///
    /// # Errors
    /// Returns error if the URL cannot be built.
    pub fn cover_art_url(&self, entity: &ArtworkEntity, size: u32) -> CacheResult<Url> {
        let mut url = self.endpoint(COVER_ART_PATH)?;
        url.query_pairs_mut()
            .append_pair("id", &entity.cover_art_id())
            .append_pair("size", &size.to_string());
        Ok(url)
    }

    /// URL of the server's ping endpoint, for reachability probes.
    ///
    /// # Errors
    /// Returns error if the URL cannot be built.
    pub fn ping_url(&self) -> CacheResult<Url> {
        self.endpoint(PING_PATH)
    }

    fn endpoint(&self, path: &str) -> CacheResult<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| CacheError::invalid_request(format!("bad endpoint {path}: {e}")))?;
        url.query_pairs_mut()
            .extend_pairs(self.auth.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }
}

/// Query parameters identifying the client and account.
fn auth_params(config: &ServerConfig) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("c", config.client_name.clone()),
        ("v", config.api_version.clone()),
    ];
    if let Some(key) = &config.api_key {
        params.push(("apiKey", key.clone()));
    } else {
        params.push(("u", config.username.clone()));
        if let Some(password) = &config.password {
            params.push(("p", format!("enc:{}", hex::encode(password))));
        }
    }
    params
}

#[async_trait]
impl ArtworkFetchPort for MediaServerFetcher {
    async fn fetch_image(&self, entity: &ArtworkEntity, size: u32) -> CacheResult<Bytes> {
        let url = self.cover_art_url(entity, size)?;
        trace!(entity = %entity, size, "Requesting cover art");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CacheError::not_found(entity.to_string()));
        }
        if !status.is_success() {
            return Err(CacheError::network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        // Subsonic reports errors as an XML or JSON body with status 200.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        if let Some(content_type) = &content_type
            && !content_type.starts_with("image/")
            && !content_type.starts_with("application/octet-stream")
        {
            return Err(CacheError::network(format!(
                "server answered with {content_type} instead of an image"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::network(format!("Failed to read body: {e}")))?;
        if bytes.is_empty() {
            return Err(CacheError::network("empty response body"));
        }

        debug!(entity = %entity, size, bytes = bytes.len(), "Downloaded cover art");
        Ok(bytes)
    }
}
