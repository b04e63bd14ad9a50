//! Schema migrations.
//!
//! Provides:
//! - [`Migration`]: a directed schema change between two versions
//! - [`MigrationContainer`]: two-level index of migrations with greedy path resolution

mod container;

pub use container::{MigrationContainer, PathNotFound};

use rusqlite::Connection;
use std::fmt;
use std::sync::Arc;

type MigrateFn = dyn Fn(&Connection) -> anyhow::Result<()> + Send + Sync;

/// A schema change from `start_version` to `end_version`.
///
/// Migrations are cheap to clone; the migration body is shared.
#[derive(Clone)]
pub struct Migration {
    start_version: u32,
    end_version: u32,
    migrate: Arc<MigrateFn>,
}

impl Migration {
    /// Create a migration from a closure run against the writer connection.
    ///
    /// The closure runs inside the exclusive migration transaction; it must
    /// not begin or commit transactions itself.
    pub fn new<F>(start_version: u32, end_version: u32, migrate: F) -> Self
    where
        F: Fn(&Connection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            start_version,
            end_version,
            migrate: Arc::new(migrate),
        }
    }

    /// Create a migration that executes a fixed batch of SQL statements.
    pub fn from_sql(start_version: u32, end_version: u32, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self::new(start_version, end_version, move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
    }

    pub fn start_version(&self) -> u32 {
        self.start_version
    }

    pub fn end_version(&self) -> u32 {
        self.end_version
    }

    /// Apply this migration to the given connection.
    pub fn apply(&self, conn: &Connection) -> crate::Result<()> {
        (self.migrate)(conn).map_err(|source| crate::Error::Migration {
            start: self.start_version,
            end: self.end_version,
            source,
        })
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("start_version", &self.start_version)
            .field("end_version", &self.end_version)
            .finish_non_exhaustive()
    }
}
