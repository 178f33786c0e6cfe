//! SQLite index implementation
//!
//! This module provides a SQLite-based implementation of the Index trait.
//! Properties are stored as a JSON object and merged on every write. Trait
//! calls run on the blocking pool so a busy database never stalls the
//! runtime's worker threads.

use crate::index::schema::initialize_schema;
use crate::index::{
    merge_properties, references_from, Index, IndexError, IndexResult, IndexedReferences,
    Properties,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A stored index record
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub hash: String,
    pub item_type: String,
    pub properties: Properties,
    pub first_seen: String,
    pub last_seen: String,
}

/// SQLite index backend
pub struct SqliteIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIndex {
    /// Opens or creates an index database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteIndex)` - Successfully opened/created database
    /// * `Err(IndexError)` - Failed to open database
    pub fn new(path: &Path) -> IndexResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets several worker processes share one database file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> IndexResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| IndexError::Poisoned)
    }

    /// Runs `op` against the connection on the blocking thread pool
    async fn blocking<T, F>(&self, op: F) -> IndexResult<T>
    where
        F: FnOnce(&mut Connection) -> IndexResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| IndexError::Poisoned)?;
            op(&mut *conn)
        })
        .await
        .map_err(|e| IndexError::Backend(format!("index task failed: {}", e)))?
    }

    /// Gets the full record for a hash
    pub fn get_item(&self, hash: &str) -> IndexResult<Option<IndexRecord>> {
        select_item(&*self.lock()?, hash)
    }

    /// Counts records per item type, sorted by type
    pub fn count_by_type(&self) -> IndexResult<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item_type, COUNT(*) FROM items GROUP BY item_type ORDER BY item_type",
        )?;

        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    /// Gets total record count
    pub fn count_total(&self) -> IndexResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn select_item(conn: &Connection, hash: &str) -> IndexResult<Option<IndexRecord>> {
    let row = conn
        .query_row(
            "SELECT hash, item_type, properties, first_seen, last_seen FROM items WHERE hash = ?1",
            params![hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((hash, item_type, properties, first_seen, last_seen)) => Ok(Some(IndexRecord {
            hash,
            item_type,
            properties: serde_json::from_str(&properties)?,
            first_seen,
            last_seen,
        })),
    }
}

fn upsert_item(
    conn: &mut Connection,
    item_type: &str,
    hash: &str,
    update: Properties,
) -> IndexResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now().to_rfc3339();

    let existing: Option<String> = tx
        .query_row(
            "SELECT properties FROM items WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(stored) => {
            let mut properties: Properties = serde_json::from_str(&stored)?;
            merge_properties(&mut properties, update);
            tx.execute(
                "UPDATE items SET item_type = ?1, properties = ?2, last_seen = ?3 WHERE hash = ?4",
                params![item_type, serde_json::to_string(&properties)?, now, hash],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO items (hash, item_type, properties, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![hash, item_type, serde_json::to_string(&update)?, now],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

#[async_trait]
impl Index for SqliteIndex {
    async fn get_references(&self, hash: &str) -> IndexResult<Option<IndexedReferences>> {
        let hash = hash.to_string();
        let record = self.blocking(move |conn| select_item(conn, &hash)).await?;

        match record {
            None => Ok(None),
            Some(record) => Ok(Some(IndexedReferences {
                references: references_from(&record.properties)?,
                item_type: record.item_type,
            })),
        }
    }

    async fn index_item(
        &self,
        item_type: &str,
        hash: &str,
        properties: Properties,
    ) -> IndexResult<()> {
        tracing::trace!("Indexing {} as {}", hash, item_type);
        let item_type = item_type.to_string();
        let hash = hash.to_string();
        self.blocking(move |conn| upsert_item(conn, &item_type, &hash, properties))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reference;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_in_memory() {
        let index = SqliteIndex::new_in_memory();
        assert!(index.is_ok());
    }

    #[tokio::test]
    async fn test_missing_hash_has_no_references() {
        let index = SqliteIndex::new_in_memory().unwrap();
        assert_eq!(index.get_references("QmNothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_index_then_lookup() {
        let index = SqliteIndex::new_in_memory().unwrap();
        index
            .index_item(
                "file",
                "QmFile",
                props(json!({
                    "size": 5,
                    "references": [{"name": "a.txt", "parent_hash": "QmP"}]
                })),
            )
            .await
            .unwrap();

        let found = index.get_references("QmFile").await.unwrap().unwrap();
        assert_eq!(found.item_type, "file");
        assert_eq!(found.references, vec![Reference::new("a.txt", "QmP")]);
    }

    #[tokio::test]
    async fn test_update_merges_properties() {
        let index = SqliteIndex::new_in_memory().unwrap();
        index
            .index_item("file", "QmFile", props(json!({"size": 5, "title": "x"})))
            .await
            .unwrap();
        index
            .index_item(
                "file",
                "QmFile",
                props(json!({"references": [{"name": "b", "parent_hash": "QmQ"}]})),
            )
            .await
            .unwrap();

        let record = index.get_item("QmFile").unwrap().unwrap();
        assert_eq!(record.properties["size"], 5);
        assert_eq!(record.properties["title"], "x");
        assert_eq!(record.properties["references"][0]["parent_hash"], "QmQ");
        assert!(record.last_seen >= record.first_seen);
    }

    #[tokio::test]
    async fn test_record_without_references_is_found() {
        let index = SqliteIndex::new_in_memory().unwrap();
        index
            .index_item("invalid", "QmBad", props(json!({"error": "proto"})))
            .await
            .unwrap();

        let found = index.get_references("QmBad").await.unwrap().unwrap();
        assert_eq!(found.item_type, "invalid");
        assert!(found.references.is_empty());
    }

    #[tokio::test]
    async fn test_counts() {
        let index = SqliteIndex::new_in_memory().unwrap();
        for (kind, hash) in [("file", "Qm1"), ("file", "Qm2"), ("directory", "Qm3")] {
            index.index_item(kind, hash, Properties::new()).await.unwrap();
        }

        assert_eq!(index.count_total().unwrap(), 3);
        assert_eq!(
            index.count_by_type().unwrap(),
            vec![("directory".to_string(), 1), ("file".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_file_backed_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let index = SqliteIndex::new(&path).unwrap();
            index
                .index_item("directory", "QmDir", Properties::new())
                .await
                .unwrap();
        }

        let reopened = SqliteIndex::new(&path).unwrap();
        assert_eq!(reopened.count_total().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SqliteIndex::new(&dir.path().join("index.db")).unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..16 {
            let index = Arc::clone(&index);
            tasks.spawn(async move {
                index
                    .index_item("file", &format!("Qm{}", n), props(json!({"size": n})))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(index.count_total().unwrap(), 16);
        let found = index.get_references("Qm7").await.unwrap().unwrap();
        assert_eq!(found.item_type, "file");
    }
}
