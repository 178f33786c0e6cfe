//! HTTP extractor backed by an ipfs-tika server
//!
//! This module handles:
//! - Building the HTTP client with the configured timeout
//! - Mapping resolvable paths onto extraction URLs
//! - Retrying GETs on transient network failures
//! - Rejecting bad statuses and undecodable bodies

use crate::config::ExtractorConfig;
use crate::extractor::{Extractor, Metadata};
use crate::retry::{FetchError, RetryPolicy};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Builds an HTTP client for crawler collaborators
///
/// # Arguments
///
/// * `timeout` - Total per-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Extracts metadata through the ipfs-tika HTTP API
pub struct TikaExtractor {
    base_url: Url,
    client: Client,
    retry: RetryPolicy,
    attempts: AtomicU64,
}

impl TikaExtractor {
    /// Creates a new extractor
    ///
    /// # Arguments
    ///
    /// * `config` - Extraction service configuration
    /// * `retry` - Back-off used for transient failures
    ///
    /// # Returns
    ///
    /// * `Ok(TikaExtractor)` - Ready to extract
    /// * `Err(FetchError::InvalidRequest)` - The base URL or client is unusable
    pub fn new(config: &ExtractorConfig, retry: RetryPolicy) -> Result<Self, FetchError> {
        let base_url = Url::parse(&config.url).map_err(|e| {
            FetchError::InvalidRequest(format!("extractor url '{}': {}", config.url, e))
        })?;
        let client = build_http_client(config.request_timeout())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            base_url,
            client,
            retry,
            attempts: AtomicU64::new(0),
        })
    }

    /// Number of HTTP requests sent so far, retries included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Appends the path segments of `path` to the base URL, percent-encoding names
    pub fn extract_url(&self, path: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                FetchError::InvalidRequest(format!("'{}' cannot be a base URL", self.base_url))
            })?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    /// Sends one GET and decodes the response
    async fn get_once(&self, url: &Url) -> Result<Metadata, FetchError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Fetching metadata from '{}'", url);

        let request = self
            .client
            .get(url.clone())
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(FetchError::from_reqwest)?;

        serde_json::from_slice::<Metadata>(&body)
            .map_err(|e| FetchError::Decode(format!("{} from {}", e, url)))
    }
}

#[async_trait]
impl Extractor for TikaExtractor {
    async fn extract(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<Metadata, FetchError> {
        let url = self.extract_url(path)?;
        let what = format!("GET {}", url);

        self.retry.run(cancel, &what, || self.get_once(&url)).await
    }
}
