//! SQLite schema definitions.

use rusqlite::Connection;
use tracing::info;

use crate::error::{BackendError, StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

fn schema_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SchemaError { message })
}

/// Initialize the database schema. Safe to call repeatedly.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!(version = SCHEMA_VERSION, "Initialized SQLite schema");
    } else if current_version > SCHEMA_VERSION {
        return Err(schema_error(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| schema_error(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| schema_error(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| schema_error(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Creates the base tables.
///
/// `resources` holds one row per resource with its newest version. The
/// `(resource_type, id)` pair is unique across partitions. `resource_index`
/// holds the secondary index rows of the newest version, one category per row.
fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS resources (
            pid INTEGER PRIMARY KEY,
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            partition_id INTEGER,
            version INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            data BLOB NOT NULL,
            last_updated TEXT NOT NULL,
            populated TEXT NOT NULL,
            UNIQUE (resource_type, id)
        );

        CREATE INDEX IF NOT EXISTS idx_resources_updated
            ON resources (last_updated);

        CREATE TABLE IF NOT EXISTS resource_index (
            pid INTEGER NOT NULL REFERENCES resources (pid),
            partition_id INTEGER,
            resource_type TEXT NOT NULL,
            param_name TEXT NOT NULL,
            category TEXT NOT NULL,
            value TEXT NOT NULL,
            hash_value INTEGER,
            hash_system_and_value INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_resource_index_pid
            ON resource_index (pid, category);

        CREATE INDEX IF NOT EXISTS idx_resource_index_hash_value
            ON resource_index (hash_value);

        CREATE INDEX IF NOT EXISTS idx_resource_index_hash_system_and_value
            ON resource_index (hash_system_and_value);
        ",
    )
    .map_err(|e| schema_error(format!("Failed to create tables: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(initialize_schema(&conn).is_err());
    }
}
