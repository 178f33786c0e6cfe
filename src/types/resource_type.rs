/// Resource type definitions for crawled objects
///
/// This module defines how a listed hash is classified.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an object in the content-addressed filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Listed successfully but of a kind the crawler does not index
    Unsupported,

    /// A regular file
    File,

    /// A directory with child links
    Directory,
}

impl ResourceType {
    /// Maps a filesystem listing type ("File", "Directory", ...) onto a resource type
    ///
    /// Anything other than a file or directory is unsupported.
    pub fn from_listing_type(kind: &str) -> Self {
        match kind {
            "File" | "file" => Self::File,
            "Directory" | "directory" => Self::Directory,
            _ => Self::Unsupported,
        }
    }

    /// Converts the type to the string stored in the index
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
