//! Metadata extraction
//!
//! File metadata comes from an external extraction service (ipfs-tika) that
//! resolves IPFS paths itself and answers with a JSON document. This module
//! defines the capability the crawler depends on and the HTTP implementation.

mod tika;

pub use tika::{build_http_client, TikaExtractor};

use crate::retry::FetchError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Structured metadata returned by the extraction service
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Extracts metadata for a resolvable path
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetches metadata for `path` (e.g. `/{parent_hash}/{name}`)
    ///
    /// Transient failures are retried until `cancel` fires; every other
    /// failure is returned as-is for the caller to classify.
    async fn extract(&self, cancel: &CancellationToken, path: &str)
        -> Result<Metadata, FetchError>;
}
