//! Database configuration.
//!
//! Supports:
//! - A typed [`Builder`] that validates its input once, in `build()`
//! - An immutable [`DatabaseConfiguration`] shared by every component
//! - Sensible defaults (WAL journaling, migrations required, 4 readers)

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::converters::{TypeConverter, TypeConverters};
use crate::database::Database;
use crate::delegate::{AutoMigrationSpec, Callback, OpenDelegate};
use crate::error::{ConfigurationError, Result};
use crate::migration::{Migration, MigrationContainer};
use crate::storage::driver::{is_in_memory, Driver};

/// Default size of the read-only pool under write-ahead logging.
pub const DEFAULT_READER_POOL_SIZE: u32 = 4;

/// Journal modes for the SQLite database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Truncate the rollback journal on commit.
    Truncate,
    /// Write-ahead logging. Readers may run alongside the writer.
    #[default]
    WriteAheadLogging,
}

impl JournalMode {
    /// Value for `PRAGMA journal_mode`.
    pub fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::WriteAheadLogging => "WAL",
        }
    }
}

/// Immutable configuration produced by [`Builder::build`].
#[non_exhaustive]
pub struct DatabaseConfiguration {
    /// Database file name, or `None` for an in-memory database.
    pub name: Option<String>,
    pub journal_mode: JournalMode,
    pub require_migration: bool,
    pub allow_destructive_migration_on_downgrade: bool,
    pub allow_destructive_migration_for_all_tables: bool,
    pub migration_not_required_from: BTreeSet<u32>,
    pub migration_container: MigrationContainer,
    pub auto_migration_specs: Vec<Arc<dyn AutoMigrationSpec>>,
    pub type_converters: TypeConverters,
    pub callbacks: Vec<Arc<dyn Callback>>,
    pub driver: Arc<dyn Driver>,
    /// Runtime used for connection work and notification passes.
    pub query_context: Handle,
    pub reader_pool_size: u32,
}

impl DatabaseConfiguration {
    /// Whether a migration from `from_version` to `to_version` is required,
    /// i.e. destructive recreation is not allowed as a fallback.
    pub fn is_migration_required(&self, from_version: u32, to_version: u32) -> bool {
        let is_downgrade = from_version > to_version;
        if is_downgrade && self.allow_destructive_migration_on_downgrade {
            return false;
        }
        self.require_migration && !self.migration_not_required_from.contains(&from_version)
    }

    pub fn is_in_memory(&self) -> bool {
        is_in_memory(self.name.as_deref())
    }
}

impl std::fmt::Debug for DatabaseConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfiguration")
            .field("name", &self.name)
            .field("journal_mode", &self.journal_mode)
            .field("require_migration", &self.require_migration)
            .field(
                "allow_destructive_migration_on_downgrade",
                &self.allow_destructive_migration_on_downgrade,
            )
            .field(
                "allow_destructive_migration_for_all_tables",
                &self.allow_destructive_migration_for_all_tables,
            )
            .field("migration_not_required_from", &self.migration_not_required_from)
            .field("migrations", &self.migration_container.len())
            .field("type_converters", &self.type_converters)
            .field("callbacks", &self.callbacks.len())
            .field("reader_pool_size", &self.reader_pool_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Database`].
pub struct Builder {
    name: Option<String>,
    delegate: Arc<dyn OpenDelegate>,
    driver: Option<Arc<dyn Driver>>,
    callbacks: Vec<Arc<dyn Callback>>,
    type_converters: TypeConverters,
    journal_mode: JournalMode,
    query_context: Option<Handle>,
    migration_container: MigrationContainer,
    /// Versions configured via [`Builder::fallback_to_destructive_migration_from`].
    migrations_not_required_from: BTreeSet<u32>,
    auto_migration_specs: Vec<Arc<dyn AutoMigrationSpec>>,
    require_migration: bool,
    allow_destructive_migration_on_downgrade: bool,
    allow_destructive_migration_for_all_tables: bool,
    reader_pool_size: u32,
}

impl Builder {
    /// Start building a database.
    ///
    /// # Arguments
    ///
    /// * `name` - Database file name, or `None` for an in-memory database
    /// * `delegate` - Schema owner used to create, migrate and open the database
    pub fn new<D: OpenDelegate>(name: Option<&str>, delegate: D) -> Self {
        Self {
            name: name.map(str::to_string),
            delegate: Arc::new(delegate),
            driver: None,
            callbacks: Vec::new(),
            type_converters: TypeConverters::new(),
            journal_mode: JournalMode::default(),
            query_context: None,
            migration_container: MigrationContainer::new(),
            migrations_not_required_from: BTreeSet::new(),
            auto_migration_specs: Vec::new(),
            require_migration: true,
            allow_destructive_migration_on_downgrade: false,
            allow_destructive_migration_for_all_tables: false,
            reader_pool_size: DEFAULT_READER_POOL_SIZE,
        }
    }

    /// Set the driver used to open connections.
    pub fn set_driver<D: Driver>(mut self, driver: D) -> Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Add migrations. A migration with the same start and end versions as
    /// an earlier one replaces it.
    pub fn add_migrations<I>(mut self, migrations: I) -> Self
    where
        I: IntoIterator<Item = Migration>,
    {
        self.migration_container.add_migrations(migrations);
        self
    }

    /// Provide a spec required by a generated auto migration.
    pub fn add_auto_migration_spec<S: AutoMigrationSpec>(mut self, spec: S) -> Self {
        self.auto_migration_specs.push(Arc::new(spec));
        self
    }

    /// Recreate the schema when no migration path exists, for upgrades and
    /// downgrades.
    ///
    /// With `drop_all_tables` every table in the file is dropped, including
    /// tables the delegate does not own.
    pub fn fallback_to_destructive_migration(mut self, drop_all_tables: bool) -> Self {
        self.require_migration = false;
        self.allow_destructive_migration_on_downgrade = true;
        self.allow_destructive_migration_for_all_tables = drop_all_tables;
        self
    }

    /// Recreate the schema only when downgrading without a migration path.
    pub fn fallback_to_destructive_migration_on_downgrade(mut self, drop_all_tables: bool) -> Self {
        self.require_migration = true;
        self.allow_destructive_migration_on_downgrade = true;
        self.allow_destructive_migration_for_all_tables = drop_all_tables;
        self
    }

    /// Allow destructive recreation when the stored version is one of
    /// `start_versions`.
    ///
    /// None of these versions may be the start or end of a registered
    /// migration; `build()` fails otherwise.
    pub fn fallback_to_destructive_migration_from<I>(
        mut self,
        drop_all_tables: bool,
        start_versions: I,
    ) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        self.migrations_not_required_from.extend(start_versions);
        self.allow_destructive_migration_for_all_tables = drop_all_tables;
        self
    }

    /// Register a type converter instance.
    pub fn add_type_converter<T: TypeConverter>(mut self, converter: T) -> Self {
        self.type_converters.insert(converter);
        self
    }

    /// Set the journal mode. Ignored for in-memory databases.
    pub fn set_journal_mode(mut self, journal_mode: JournalMode) -> Self {
        self.journal_mode = journal_mode;
        self
    }

    /// Set the runtime used for connection work and notification passes.
    ///
    /// Defaults to the runtime `build()` is called from.
    pub fn set_query_execution_context(mut self, handle: Handle) -> Self {
        self.query_context = Some(handle);
        self
    }

    /// Maximum number of read-only connections under write-ahead logging.
    pub fn set_reader_pool_size(mut self, size: u32) -> Self {
        self.reader_pool_size = size.max(1);
        self
    }

    /// Add a lifecycle callback.
    pub fn add_callback<C: Callback>(mut self, callback: C) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Validate the configuration and initialize the database.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no driver was set, no execution
    /// context is available, a destructive-fallback version overlaps a
    /// migration boundary, or auto migration specs / type converters do not
    /// match what the delegate requires.
    pub fn build(self) -> Result<Database> {
        let driver = self.driver.ok_or(ConfigurationError::MissingDriver)?;

        let query_context = match self.query_context {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ConfigurationError::MissingExecutionContext)?,
        };

        validate_migrations_not_required(
            &self.migration_container,
            &self.migrations_not_required_from,
        )?;

        let configuration = DatabaseConfiguration {
            name: self.name,
            journal_mode: self.journal_mode,
            require_migration: self.require_migration,
            allow_destructive_migration_on_downgrade: self.allow_destructive_migration_on_downgrade,
            allow_destructive_migration_for_all_tables: self
                .allow_destructive_migration_for_all_tables,
            migration_not_required_from: self.migrations_not_required_from,
            migration_container: self.migration_container,
            auto_migration_specs: self.auto_migration_specs,
            type_converters: self.type_converters,
            callbacks: self.callbacks,
            driver,
            query_context,
            reader_pool_size: self.reader_pool_size,
        };

        Database::init(configuration, self.delegate)
    }
}

/// Reject versions that are both a destructive-fallback start and a
/// migration boundary.
fn validate_migrations_not_required(
    container: &MigrationContainer,
    not_required_from: &BTreeSet<u32>,
) -> std::result::Result<(), ConfigurationError> {
    if let Some(version) = container
        .versions()
        .filter(|version| not_required_from.contains(version))
        .min()
    {
        return Err(ConfigurationError::OverlappingVersion { version });
    }
    Ok(())
}
