//! Connection drivers.
//!
//! A [`Driver`] opens the physical SQLite connections the lifecycle manages:
//! one read-write connection and, for file databases, a pool of read-only
//! connections.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

/// Opens physical connections to the storage engine.
pub trait Driver: Send + Sync + 'static {
    /// Open the read-write connection. `None` opens an in-memory database.
    fn open(&self, name: Option<&str>) -> rusqlite::Result<Connection>;

    /// Connection manager used by the read-only pool of a file database.
    fn reader_manager(&self, name: &str) -> SqliteConnectionManager;
}

/// Default driver backed by the bundled SQLite library.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for SqliteDriver {
    fn open(&self, name: Option<&str>) -> rusqlite::Result<Connection> {
        match name {
            Some(path) if !is_in_memory(Some(path)) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            ),
            _ => Connection::open_in_memory(),
        }
    }

    fn reader_manager(&self, name: &str) -> SqliteConnectionManager {
        SqliteConnectionManager::file(name)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            )
    }
}

/// Whether a database name refers to an in-memory database.
pub fn is_in_memory(name: Option<&str>) -> bool {
    matches!(name, None | Some(":memory:") | Some(""))
}
