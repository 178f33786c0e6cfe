//! Search index access
//!
//! The crawler talks to the index through two operations only:
//! - `get_references`: has this hash been indexed, as what, and who links to it
//! - `index_item`: create a record or merge properties into an existing one
//!
//! Two backends are provided: a SQLite index for single-host deployments and
//! an in-memory index (behind the `mock` feature) that also records every
//! write for inspection.

#[cfg(any(test, feature = "mock"))]
mod memory;
mod schema;
mod sqlite;

#[cfg(any(test, feature = "mock"))]
pub use memory::{IndexWrite, MemoryIndex};
pub use sqlite::{IndexRecord, SqliteIndex};

use crate::types::Reference;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Property mapping stored with every record
pub type Properties = serde_json::Map<String, Value>;

/// Errors that can occur during index operations
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Index lock poisoned")]
    Poisoned,

    #[error("Index backend error: {0}")]
    Backend(String),
}

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// What the index knows about a previously indexed hash
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedReferences {
    /// Type the record was stored as ("file", "directory", "invalid", ...)
    pub item_type: String,
    pub references: Vec<Reference>,
}

/// Index collaborator used by the crawler
#[async_trait]
pub trait Index: Send + Sync {
    /// Looks up the references and type recorded for `hash`
    ///
    /// Returns `None` when the hash has never been indexed.
    async fn get_references(&self, hash: &str) -> IndexResult<Option<IndexedReferences>>;

    /// Creates the record for `hash` or merges `properties` into it
    ///
    /// Top-level keys overwrite existing ones; the type is replaced.
    async fn index_item(
        &self,
        item_type: &str,
        hash: &str,
        properties: Properties,
    ) -> IndexResult<()>;
}

/// Extracts the reference list from stored properties
///
/// Records without a `references` key have no references yet.
pub fn references_from(properties: &Properties) -> IndexResult<Vec<Reference>> {
    match properties.get("references") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

/// Merges `update` into `existing`, last write winning per top-level key
pub fn merge_properties(existing: &mut Properties, update: Properties) {
    for (key, value) in update {
        existing.insert(key, value);
    }
}
