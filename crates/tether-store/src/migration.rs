//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Records of every collection, keyed per collection
        CREATE TABLE records (
            collection TEXT NOT NULL,         -- entity type or relationship name
            key INTEGER NOT NULL,             -- local store key
            body BLOB NOT NULL,               -- CBOR-encoded record
            updated_at INTEGER NOT NULL,      -- local timestamp of last write
            PRIMARY KEY (collection, key)
        );

        -- Free-form key/value pairs (fetch watermarks and the like)
        CREATE TABLE metadata (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,              -- CBOR-encoded value
            PRIMARY KEY (collection, key)
        );
        "#,
    )?;

    Ok(())
}

/// Migration v2: per-collection key sequences, so a removed key is never
/// handed out again.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE key_sequences (
            collection TEXT PRIMARY KEY,
            last_key INTEGER NOT NULL         -- highest key ever assigned or written
        );

        INSERT INTO key_sequences (collection, last_key)
            SELECT collection, MAX(key) FROM records GROUP BY collection;
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
