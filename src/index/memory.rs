//! In-memory index backend
//!
//! Records live in a `HashMap` behind a [`RwLock`]. Every `index_item` call is
//! also appended to a write log, so callers can check exactly which writes a
//! crawl produced.

use crate::index::{
    merge_properties, references_from, Index, IndexError, IndexResult, IndexedReferences,
    Properties,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One recorded `index_item` call
#[derive(Debug, Clone, PartialEq)]
pub struct IndexWrite {
    pub item_type: String,
    pub hash: String,
    pub properties: Properties,
}

#[derive(Default)]
struct State {
    records: HashMap<String, (String, Properties)>,
    writes: Vec<IndexWrite>,
    lookups: usize,
    fail_lookups: bool,
}

/// In-memory index with a write log
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record without logging it as a write
    pub async fn insert(&self, item_type: &str, hash: &str, properties: Properties) {
        let mut state = self.state.write().await;
        state
            .records
            .insert(hash.to_string(), (item_type.to_string(), properties));
    }

    /// Returns every `index_item` call made so far, oldest first
    pub async fn writes(&self) -> Vec<IndexWrite> {
        self.state.read().await.writes.clone()
    }

    /// Number of `get_references` calls made so far
    pub async fn lookups(&self) -> usize {
        self.state.read().await.lookups
    }

    /// Returns the stored type and properties for a hash
    pub async fn record(&self, hash: &str) -> Option<(String, Properties)> {
        self.state.read().await.records.get(hash).cloned()
    }

    /// Makes subsequent lookups fail, simulating an unavailable index
    pub async fn fail_lookups(&self, fail: bool) {
        self.state.write().await.fail_lookups = fail;
    }
}

#[async_trait]
impl Index for MemoryIndex {
    async fn get_references(&self, hash: &str) -> IndexResult<Option<IndexedReferences>> {
        let mut state = self.state.write().await;
        state.lookups += 1;

        if state.fail_lookups {
            return Err(IndexError::Backend("index unavailable".to_string()));
        }

        match state.records.get(hash) {
            None => Ok(None),
            Some((item_type, properties)) => Ok(Some(IndexedReferences {
                item_type: item_type.clone(),
                references: references_from(properties)?,
            })),
        }
    }

    async fn index_item(
        &self,
        item_type: &str,
        hash: &str,
        properties: Properties,
    ) -> IndexResult<()> {
        let mut state = self.state.write().await;
        state.writes.push(IndexWrite {
            item_type: item_type.to_string(),
            hash: hash.to_string(),
            properties: properties.clone(),
        });

        let entry = state
            .records
            .entry(hash.to_string())
            .or_insert_with(|| (item_type.to_string(), Properties::new()));
        entry.0 = item_type.to_string();
        merge_properties(&mut entry.1, properties);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_are_logged_and_merged() {
        let index = MemoryIndex::new();
        let first = json!({"size": 1}).as_object().unwrap().clone();
        let second = json!({"title": "t"}).as_object().unwrap().clone();

        index.index_item("file", "QmA", first).await.unwrap();
        index.index_item("file", "QmA", second).await.unwrap();

        assert_eq!(index.writes().await.len(), 2);
        let (item_type, properties) = index.record("QmA").await.unwrap();
        assert_eq!(item_type, "file");
        assert_eq!(properties["size"], 1);
        assert_eq!(properties["title"], "t");
    }

    #[tokio::test]
    async fn test_seeded_records_are_not_writes() {
        let index = MemoryIndex::new();
        index.insert("directory", "QmD", Properties::new()).await;

        assert!(index.writes().await.is_empty());
        let found = index.get_references("QmD").await.unwrap().unwrap();
        assert_eq!(found.item_type, "directory");
        assert_eq!(index.lookups().await, 1);
    }

    #[tokio::test]
    async fn test_failing_lookups() {
        let index = MemoryIndex::new();
        index.fail_lookups(true).await;
        assert!(index.get_references("QmX").await.is_err());
    }
}
