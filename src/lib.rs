//! ipfs-crawler: a queue-driven crawler for content-addressed filesystems
//!
//! This crate walks IPFS hashes, classifies them as files or directories,
//! deduplicates them against an index through accumulated parent references,
//! extracts file metadata through an external extraction service and feeds the
//! results into a search index. Work moves between crawl stages through a
//! flow-controlled message queue so it can be spread across processes.

pub mod config;
pub mod crawler;
pub mod extractor;
pub mod index;
pub mod ipfs;
pub mod retry;
pub mod transport;
pub mod types;

use thiserror::Error;

/// Main error type for crawl operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Index error: {0}")]
    Index(#[from] index::IndexError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Fetch error for {hash}: {source}")]
    Fetch {
        hash: String,
        source: retry::FetchError,
    },

    #[error("Unrecoverable error for {hash}: {source}")]
    Fatal {
        hash: String,
        source: retry::FetchError,
    },

    #[error("{hash} ({name}) too large: {size} bytes exceeds {max} bytes, not indexing")]
    TooLarge {
        hash: String,
        name: String,
        size: u64,
        max: u64,
    },

    #[error("Failed to encode work item for {hash}: {source}")]
    Encode {
        hash: String,
        source: serde_json::Error,
    },

    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// How a failure must be handled by whoever owns the work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Protocol corruption; abort the process after a best-effort poison record.
    Fatal,
    /// A required resource is gone for good (reconnect ceiling exceeded).
    Unrecoverable,
    /// The item itself cannot be processed; acknowledge and drop it.
    Item,
    /// Infrastructure hiccup unrelated to the item; leave it for redelivery.
    Redeliver,
    /// Caller-initiated stop.
    Cancelled,
}

impl CrawlError {
    /// Maps this error onto the failure taxonomy
    pub fn severity(&self) -> Severity {
        match self {
            Self::Fatal { .. } => Severity::Fatal,
            Self::ConnectionLost(_) | Self::Worker(_) => Severity::Unrecoverable,
            Self::Transport(transport::TransportError::ConnectionLost { .. }) => {
                Severity::Unrecoverable
            }
            Self::Cancelled => Severity::Cancelled,
            Self::Fetch {
                source: retry::FetchError::Cancelled,
                ..
            } => Severity::Cancelled,
            // A stored record that does not decode stays broken on redelivery
            Self::Index(index::IndexError::Serialization(_)) => Severity::Item,
            Self::Index(_) | Self::Transport(_) => Severity::Redeliver,
            Self::Config(_) => Severity::Unrecoverable,
            Self::Fetch { .. } | Self::TooLarge { .. } | Self::Encode { .. } => Severity::Item,
        }
    }

    /// Returns true when the process must stop after this error
    pub fn is_terminal(&self) -> bool {
        matches!(self.severity(), Severity::Fatal | Severity::Unrecoverable)
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for crawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlOutcome, Crawler};
pub use types::{Reference, ResourceType, WorkItem};
