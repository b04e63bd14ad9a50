//! Capability traits implemented outside this crate.
//!
//! Generated or hand-written schema code plugs into the lifecycle through
//! these traits:
//! - [`OpenDelegate`]: creates, validates and opens the schema
//! - [`Callback`]: observes lifecycle events
//! - [`AutoMigrationSpec`]: extra hooks for generated migrations

use rusqlite::Connection;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::migration::Migration;

/// Outcome of a schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Human readable "expected / found" description when invalid.
    pub expected_found_msg: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            expected_found_msg: None,
        }
    }

    pub fn invalid(expected_found_msg: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            expected_found_msg: Some(expected_found_msg.into()),
        }
    }
}

/// Auto migration specs provided to the builder, keyed by their tag.
pub type AutoMigrationSpecs = HashMap<&'static str, Arc<dyn AutoMigrationSpec>>;

/// Schema owner for a database.
///
/// The lifecycle calls these hooks on the writer connection while it opens
/// the database. Hooks that run during creation or migration are inside the
/// exclusive open transaction.
pub trait OpenDelegate: Send + Sync + 'static {
    /// Target schema version. Version 0 is reserved for "not created".
    fn version(&self) -> u32;

    /// Hash identifying the exact schema of [`OpenDelegate::version`].
    fn identity_hash(&self) -> &str;

    /// Create every table, index, view and trigger of the current schema.
    fn create_all_tables(&self, conn: &Connection) -> anyhow::Result<()>;

    /// Drop every table this delegate owns.
    fn drop_all_tables(&self, conn: &Connection) -> anyhow::Result<()>;

    /// Compare the on-disk schema with the expected one.
    fn on_validate_schema(&self, conn: &Connection) -> ValidationResult;

    /// Called after the schema was created for the first time.
    fn on_create(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the database is open and ready.
    fn on_open(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before the first migration of a path runs.
    fn on_pre_migrate(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after migrations ran and the schema validated.
    fn on_post_migrate(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Table names tracked by the invalidation tracker.
    fn table_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Map of view name to the tables the view reads from.
    fn view_tables(&self) -> HashMap<String, Vec<String>> {
        HashMap::new()
    }

    /// Tags of the auto migration specs the generated migrations need.
    fn required_auto_migration_specs(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Build the generated auto migrations from the provided specs.
    fn create_auto_migrations(&self, _specs: &AutoMigrationSpecs) -> Vec<Migration> {
        Vec::new()
    }

    /// Type converter tags required per DAO name.
    fn required_type_converters(&self) -> HashMap<&'static str, Vec<&'static str>> {
        HashMap::new()
    }
}

/// Lifecycle observer registered through `Builder::add_callback`.
pub trait Callback: Send + Sync + 'static {
    /// The schema was created, either fresh or after a destructive migration.
    fn on_create(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// The schema was dropped and recreated.
    fn on_destructive_migration(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// The database finished opening.
    fn on_open(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }
}

/// User-provided counterpart of a generated auto migration.
pub trait AutoMigrationSpec: Any + Send + Sync {
    /// Stable tag matching the one listed by
    /// [`OpenDelegate::required_auto_migration_specs`].
    fn tag(&self) -> &'static str;

    /// Called after the generated migration statements ran.
    fn on_post_migrate(&self, _conn: &Connection) -> anyhow::Result<()> {
        Ok(())
    }
}
