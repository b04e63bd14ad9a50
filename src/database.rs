//! Database handle: the public entry point.
//!
//! A [`Database`] owns the connection manager, the invalidation tracker and
//! the execution context. Every connection use enters the close barrier, so
//! [`Database::close`] defers teardown until in-flight work finishes while
//! rejecting new work immediately.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use crate::config::{Builder, DatabaseConfiguration, JournalMode};
use crate::converters::TypeConverter;
use crate::delegate::{AutoMigrationSpecs, OpenDelegate};
use crate::error::{ConfigurationError, Error, Result};
use crate::flow::barrier::CloseBarrier;
use crate::flow::invalidation::InvalidationTracker;
use crate::flow::task_group::TaskGroup;
use crate::migration::MigrationContainer;
use crate::storage::manager::ConnectionManager;
use crate::storage::transactor::{TransactionType, Transactor};

/// An application database with managed schema lifecycle.
pub struct Database {
    configuration: Arc<DatabaseConfiguration>,
    manager: Arc<ConnectionManager>,
    tracker: Arc<InvalidationTracker>,
    barrier: Arc<CloseBarrier>,
}

/// Work performed once the close barrier drains.
///
/// Holds weak references so the barrier does not keep the manager and
/// tracker alive after the database is dropped.
struct Teardown {
    context: TaskGroup,
    tracker: Weak<InvalidationTracker>,
    manager: Weak<ConnectionManager>,
}

impl Teardown {
    fn run(&self) {
        self.context.cancel();
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.stop();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.close();
        }
        tracing::info!("Database closed");
    }
}

impl Database {
    /// Start building a database.
    ///
    /// # Arguments
    ///
    /// * `name` - Database file name, or `None` for an in-memory database
    /// * `delegate` - Schema owner used to create, migrate and open the database
    pub fn builder<D: OpenDelegate>(name: Option<&str>, delegate: D) -> Builder {
        Builder::new(name, delegate)
    }

    /// Validate delegate requirements and wire the database together.
    ///
    /// No connection is opened here; the first connection use opens it.
    pub(crate) fn init(
        configuration: DatabaseConfiguration,
        delegate: Arc<dyn OpenDelegate>,
    ) -> Result<Self> {
        validate_type_converters(&configuration, delegate.as_ref())?;
        let migrations = resolve_migrations(&configuration, delegate.as_ref())?;

        let context = TaskGroup::new(configuration.query_context.clone());
        let teardown: Arc<OnceLock<Teardown>> = Arc::new(OnceLock::new());
        let barrier = Arc::new(CloseBarrier::new({
            let teardown = Arc::clone(&teardown);
            move || {
                if let Some(teardown) = teardown.get() {
                    teardown.run();
                }
            }
        }));

        let tracker = Arc::new(InvalidationTracker::new(
            delegate.table_names(),
            delegate.view_tables(),
            context.clone(),
            Arc::clone(&barrier),
        ));

        let configuration = Arc::new(configuration);
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&configuration),
            delegate,
            migrations,
            Arc::clone(&tracker),
            context.clone(),
        ));

        // Freshly created, so the cell is empty.
        let _ = teardown.set(Teardown {
            context,
            tracker: Arc::downgrade(&tracker),
            manager: Arc::downgrade(&manager),
        });

        tracing::info!(
            name = ?configuration.name,
            journal_mode = ?configuration.journal_mode,
            "Database initialized"
        );

        Ok(Self {
            configuration,
            manager,
            tracker,
            barrier,
        })
    }

    /// Acquire a connection and run `block` with it.
    ///
    /// Connection work runs on the blocking pool of the query execution
    /// context. A transaction left open by `block` is rolled back when the
    /// connection is released.
    ///
    /// # Arguments
    ///
    /// * `read_only` - Whether `block` only reads; read-only blocks may run
    ///   concurrently on pooled reader connections
    /// * `block` - Work to run with the acquired connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClosedDatabase`] after [`Database::close`], an open
    /// error on the first use, or the error returned by `block`.
    pub async fn use_connection<R, F>(&self, read_only: bool, block: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        let lease = self.barrier.guard().ok_or(Error::ClosedDatabase)?;
        self.manager.use_connection(read_only, lease, block).await
    }

    /// Shorthand for `use_connection(true, block)`.
    pub async fn use_reader_connection<R, F>(&self, block: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        self.use_connection(true, block).await
    }

    /// Shorthand for `use_connection(false, block)`.
    pub async fn use_writer_connection<R, F>(&self, block: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        self.use_connection(false, block).await
    }

    /// Run `block` in an immediate write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionAborted`] wrapping the failure after the
    /// transaction was rolled back.
    pub async fn with_transaction<R, F>(&self, block: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        self.use_connection(false, move |tx| {
            tx.with_transaction(TransactionType::Immediate, block)
        })
        .await
    }

    /// The tracker delivering table invalidation notifications.
    pub fn invalidation_tracker(&self) -> &Arc<InvalidationTracker> {
        &self.tracker
    }

    /// A type converter registered on the builder, if any.
    pub fn type_converter<T: TypeConverter>(&self) -> Option<Arc<T>> {
        self.configuration.type_converters.get::<T>()
    }

    pub fn configuration(&self) -> &DatabaseConfiguration {
        &self.configuration
    }

    /// Journal mode in effect. In-memory databases always report
    /// [`JournalMode::Truncate`].
    pub fn journal_mode(&self) -> JournalMode {
        if self.configuration.is_in_memory() {
            JournalMode::Truncate
        } else {
            self.configuration.journal_mode
        }
    }

    /// Close the database.
    ///
    /// New work is rejected immediately with [`Error::ClosedDatabase`].
    /// Teardown (cancelling background tasks, stopping the tracker and
    /// releasing connections) runs once in-flight work has finished.
    /// Closing more than once has no further effect.
    pub fn close(&self) {
        tracing::debug!(active = self.barrier.active(), "Close requested");
        self.barrier.close();
    }

    pub fn is_open(&self) -> bool {
        !self.barrier.is_closed()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.configuration.name)
            .field("open", &self.is_open())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

/// Check that the registered type converters are exactly the ones the
/// delegate's DAOs require.
fn validate_type_converters(
    configuration: &DatabaseConfiguration,
    delegate: &dyn OpenDelegate,
) -> std::result::Result<(), ConfigurationError> {
    let mut required: Vec<_> = delegate.required_type_converters().into_iter().collect();
    required.sort_unstable_by_key(|(dao, _)| *dao);

    let mut used = BTreeSet::new();
    for (dao, tags) in required {
        for tag in tags {
            if !configuration.type_converters.contains_tag(tag) {
                return Err(ConfigurationError::MissingTypeConverter { dao, tag });
            }
            used.insert(tag);
        }
    }

    let mut provided: Vec<_> = configuration.type_converters.tags().collect();
    provided.sort_unstable();
    match provided.into_iter().find(|tag| !used.contains(tag)) {
        Some(tag) => Err(ConfigurationError::UnexpectedTypeConverter { tag }),
        None => Ok(()),
    }
}

/// Match auto migration specs against the delegate's requirements and merge
/// the generated auto migrations into the user migrations.
///
/// User migrations win over auto migrations for the same version pair.
fn resolve_migrations(
    configuration: &DatabaseConfiguration,
    delegate: &dyn OpenDelegate,
) -> std::result::Result<MigrationContainer, ConfigurationError> {
    let provided: HashMap<&'static str, _> = configuration
        .auto_migration_specs
        .iter()
        .map(|spec| (spec.tag(), Arc::clone(spec)))
        .collect();

    let mut specs = AutoMigrationSpecs::new();
    for tag in delegate.required_auto_migration_specs() {
        let spec = provided
            .get(tag)
            .ok_or(ConfigurationError::MissingAutoMigrationSpec { tag })?;
        specs.insert(tag, Arc::clone(spec));
    }

    let mut unexpected: Vec<_> = provided.keys().filter(|tag| !specs.contains_key(*tag)).collect();
    unexpected.sort_unstable();
    if let Some(&&tag) = unexpected.first() {
        return Err(ConfigurationError::UnexpectedAutoMigrationSpec { tag });
    }

    let mut migrations = configuration.migration_container.clone();
    for migration in delegate.create_auto_migrations(&specs) {
        if migrations.contains(migration.start_version(), migration.end_version()) {
            tracing::debug!(
                start = migration.start_version(),
                end = migration.end_version(),
                "User migration overrides auto migration"
            );
            continue;
        }
        migrations.add_migration(migration);
    }
    Ok(migrations)
}
