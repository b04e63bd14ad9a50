//! Connection pragmas and schema bookkeeping.
//!
//! Provides:
//! - Writer and reader pragma setup
//! - `user_version` access for the stored schema version
//! - Identity hash persistence in the master table
//! - Dropping every user table for destructive recreation

use rusqlite::{Connection, OptionalExtension};
use std::time::Duration;

use crate::config::JournalMode;

/// Name of the table holding the schema identity hash.
pub const MASTER_TABLE_NAME: &str = "vessel_master_table";

/// Fixed row id of the identity entry.
const MASTER_ROW_ID: i64 = 42;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply pragmas to the read-write connection.
///
/// The journal mode is ignored for in-memory databases.
pub fn apply_writer_pragmas(
    conn: &Connection,
    journal_mode: JournalMode,
    in_memory: bool,
) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;

    if in_memory {
        return Ok(());
    }

    let _: String = conn.query_row(
        &format!("PRAGMA journal_mode={}", journal_mode.pragma_value()),
        [],
        |row| row.get(0),
    )?;

    let synchronous = match journal_mode {
        JournalMode::WriteAheadLogging => "NORMAL",
        JournalMode::Truncate => "FULL",
    };
    conn.execute_batch(&format!("PRAGMA synchronous={synchronous}"))?;

    Ok(())
}

/// Apply pragmas to a pooled read-only connection.
pub fn apply_reader_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA query_only=ON")?;
    Ok(())
}

/// Read the stored schema version.
pub fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Store the schema version.
pub fn set_user_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
}

/// Write the identity hash, creating the master table if needed.
pub fn write_identity(conn: &Connection, identity_hash: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {MASTER_TABLE_NAME} \
         (id INTEGER PRIMARY KEY, identity_hash TEXT)"
    ))?;
    conn.execute(
        &format!("INSERT OR REPLACE INTO {MASTER_TABLE_NAME} (id, identity_hash) VALUES (?1, ?2)"),
        rusqlite::params![MASTER_ROW_ID, identity_hash],
    )?;
    Ok(())
}

/// Read the stored identity hash.
///
/// Returns `None` when the master table does not exist or has no entry.
pub fn read_identity(conn: &Connection) -> rusqlite::Result<Option<String>> {
    if !table_exists(conn, MASTER_TABLE_NAME)? {
        return Ok(None);
    }
    conn.query_row(
        &format!("SELECT identity_hash FROM {MASTER_TABLE_NAME} WHERE id = ?1"),
        [MASTER_ROW_ID],
        |row| row.get(0),
    )
    .optional()
}

/// Check if a table exists in the main schema, ignoring case.
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Drop every user table and view, leaving SQLite internal tables alone.
pub fn drop_all_user_tables(conn: &Connection) -> rusqlite::Result<()> {
    let objects = {
        let mut stmt = conn.prepare(
            "SELECT name, type FROM sqlite_master \
             WHERE (type = 'table' OR type = 'view') AND substr(name, 1, 7) != 'sqlite_'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    // Views first so no view is left pointing at a dropped table.
    for (name, kind) in objects.iter().filter(|(_, kind)| kind == "view") {
        tracing::debug!(name = %name, kind = %kind, "Dropping schema object");
        conn.execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_identifier(name)))?;
    }
    for (name, kind) in objects.iter().filter(|(_, kind)| kind == "table") {
        tracing::debug!(name = %name, kind = %kind, "Dropping schema object");
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_identifier(name)))?;
    }
    Ok(())
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
