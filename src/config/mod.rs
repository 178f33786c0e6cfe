//! Configuration module for the crawler
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every section has defaults, so an empty file yields a local development setup.
//!
//! # Example
//!
//! ```no_run
//! use ipfs_crawler::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawler.toml")).unwrap();
//! println!("File workers: {}", config.crawler.file_workers);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{AmqpConfig, Config, CrawlerConfig, ExtractorConfig, IndexConfig, IpfsConfig};

// Re-export parser functions
pub use parser::{
    apply_env_overrides, compute_config_hash, load_config, load_config_with_hash,
    ENV_AMQP_URL, ENV_IPFS_API, ENV_TIKA_EXTRACTOR,
};
pub use validation::validate;
