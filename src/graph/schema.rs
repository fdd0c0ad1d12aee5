//! SQLite schema, migrations and integrity checks for the graph store.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

const REQUIRED_TABLES: [&str; 3] = ["schema_version", "nodes", "edges"];

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL gives readers a stable snapshot while a writer commits
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            node_type TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            edge_type TEXT NOT NULL,
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            FOREIGN KEY (from_id) REFERENCES nodes(id),
            FOREIGN KEY (to_id) REFERENCES nodes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(node_type, created_at);
        CREATE INDEX IF NOT EXISTS idx_nodes_concept
            ON nodes(node_type, json_extract(attributes, '$.concept'));
        CREATE INDEX IF NOT EXISTS idx_nodes_session
            ON nodes(node_type, json_extract(attributes, '$.session_id'));
        CREATE INDEX IF NOT EXISTS idx_nodes_path
            ON nodes(node_type, json_extract(attributes, '$.path'));
        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_id, edge_type);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id, edge_type);

        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> Result<bool> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Verify an existing database before use.
///
/// Any failure is reported as [`Error::Corruption`]; callers must not retry.
pub fn verify_integrity(conn: &Connection) -> Result<()> {
    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| Error::Corruption(format!("integrity check failed: {}", e)))?;
    if check != "ok" {
        return Err(Error::Corruption(format!("integrity check reported: {}", check)));
    }

    if !is_initialized(conn)? {
        let tables: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
            [],
            |row| row.get(0),
        )?;
        if tables > 0 {
            return Err(Error::Corruption(
                "database contains foreign tables and no schema version".to_string(),
            ));
        }
        return Ok(());
    }

    let version = get_schema_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(Error::Corruption(format!(
            "schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    for table in REQUIRED_TABLES {
        let present: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Err(Error::Corruption(format!("missing table '{}'", table)));
        }
    }

    let dangling: i64 = {
        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while rows.next()?.is_some() {
            count += 1;
        }
        count
    };
    if dangling > 0 {
        return Err(Error::Corruption(format!(
            "{} edges reference missing nodes",
            dangling
        )));
    }

    Ok(())
}
