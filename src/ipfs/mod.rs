//! Content-addressed filesystem access
//!
//! The crawler only ever needs one capability from the filesystem: listing a
//! hash to learn its type, size and child links. `IpfsShell` implements it
//! against an IPFS node's HTTP API.

mod shell;

pub use shell::IpfsShell;

use crate::retry::FetchError;
use crate::types::ResourceType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of listing a hash
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    /// `File`, `Directory` or `Unsupported` for anything else
    pub kind: ResourceType,
    pub size: u64,
    /// Child links; empty for files
    pub links: Vec<Link>,
}

/// A directory entry pointing at another hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub hash: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: ResourceType,
}

/// Lists objects in the content-addressed filesystem
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Lists `hash`, reporting failures in the shared fetch taxonomy
    async fn list(&self, hash: &str) -> Result<Listing, FetchError>;
}
