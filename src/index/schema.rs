//! Database schema definitions
//!
//! This module contains the SQL schema for the SQLite index.

/// SQL schema for the index database
pub const SCHEMA_SQL: &str = r#"
-- One record per indexed hash
CREATE TABLE IF NOT EXISTS items (
    hash TEXT PRIMARY KEY,
    item_type TEXT NOT NULL,
    properties TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_type ON items(item_type);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
