//! Work items and references

use serde::{Deserialize, Serialize};

/// A queued unit of crawl work: one hash plus the context it was discovered in
///
/// Work items are immutable once published. An empty `parent_hash` marks a
/// root-level crawl (the hash was seeded rather than found as a child link).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Content address of the object
    pub hash: String,

    /// Name under which the parent links to this object
    #[serde(default)]
    pub name: String,

    /// Size as declared by the parent link or listing
    #[serde(default)]
    pub size: u64,

    /// Hash of the directory this object was found in
    #[serde(default)]
    pub parent_hash: String,

    /// Legacy display name of the parent, carried through unchanged
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_name: String,
}

impl WorkItem {
    /// Creates a root-level work item without parent context
    pub fn root(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            name: String::new(),
            size: 0,
            parent_hash: String::new(),
            parent_name: String::new(),
        }
    }

    /// Creates a work item for a child link of `parent_hash`
    pub fn child(
        hash: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        parent_hash: impl Into<String>,
    ) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            size,
            parent_hash: parent_hash.into(),
            parent_name: String::new(),
        }
    }

    /// Returns true for chunk-sized objects nobody links to
    ///
    /// These are filesystem chunking artifacts rather than user objects.
    pub fn is_unreferenced_partial(&self, size: u64, partial_size: u64) -> bool {
        size == partial_size && self.parent_hash.is_empty()
    }

    /// Path under which the extraction service can resolve this object
    ///
    /// `/{parent_hash}/{name}` when both are known, `/{hash}` otherwise.
    pub fn resolvable_path(&self) -> String {
        if !self.name.is_empty() && !self.parent_hash.is_empty() {
            format!("/{}/{}", self.parent_hash, self.name)
        } else {
            format!("/{}", self.hash)
        }
    }
}

/// One place a hash was linked from
///
/// A hash's references form a set keyed by `parent_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub parent_hash: String,
}

impl Reference {
    pub fn new(name: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_hash: parent_hash.into(),
        }
    }
}
