//! Reference bookkeeping and deduplication
//!
//! A hash is expanded at most once. Later sightings only add the new parent to
//! its reference set, which is keyed by parent hash.

use crate::index::{Index, IndexResult};
use crate::types::Reference;

/// Dedup state for one sighting of a hash
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Existing references plus the new one, if any
    pub references: Vec<Reference>,
    /// The index already holds a record for the hash
    pub already_indexed: bool,
    /// A reference was added by this sighting
    pub references_changed: bool,
    /// Stored type of the existing record
    pub item_type: Option<String>,
}

impl Resolution {
    /// Known hash seen from a new parent: patch its references only
    pub fn needs_reference_update(&self) -> bool {
        self.already_indexed && self.references_changed
    }
}

/// Adds `{name, parent_hash}` unless that parent is already recorded
///
/// An empty `parent_hash` (root-level crawl) never adds a reference.
///
/// # Returns
///
/// The possibly extended list and whether it changed.
pub fn update_references(
    mut references: Vec<Reference>,
    name: &str,
    parent_hash: &str,
) -> (Vec<Reference>, bool) {
    if parent_hash.is_empty() {
        return (references, false);
    }

    if references.iter().any(|r| r.parent_hash == parent_hash) {
        return (references, false);
    }

    references.push(Reference::new(name, parent_hash));
    (references, true)
}

/// Looks `hash` up in the index and merges in the new sighting
///
/// Nothing is written; persisting a reference update is up to the caller.
pub async fn resolve(
    index: &dyn Index,
    hash: &str,
    name: &str,
    parent_hash: &str,
) -> IndexResult<Resolution> {
    let existing = index.get_references(hash).await?;

    let (references, item_type, already_indexed) = match existing {
        Some(found) => (found.references, Some(found.item_type), true),
        None => (Vec::new(), None, false),
    };

    let (references, references_changed) = update_references(references, name, parent_hash);

    Ok(Resolution {
        references,
        already_indexed,
        references_changed,
        item_type,
    })
}
