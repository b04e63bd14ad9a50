//! Connection manager: lazy open, schema lifecycle and connection access.
//!
//! Provides:
//! - First-use open guarded by a `OnceCell`, so concurrent first callers
//!   share one open attempt; the attempt runs as its own task and is not
//!   cut short when a waiting caller is cancelled
//! - Create / migrate / destructive-recreate sequencing inside one
//!   exclusive transaction
//! - One serialized writer connection and a pool of read-only connections
//! - A reader/writer gate when the journal mode does not allow readers to
//!   run alongside the writer

use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OnceCell, RwLock, Semaphore};
use tokio::task::JoinHandle;

use super::reader::ReaderPool;
use super::schema::{
    apply_writer_pragmas, drop_all_user_tables, read_identity, set_user_version, user_version,
    write_identity,
};
use super::transactor::{TransactionType, Transactor};
use crate::config::{DatabaseConfiguration, JournalMode};
use crate::delegate::OpenDelegate;
use crate::error::{Error, Result};
use crate::flow::barrier::BarrierGuard;
use crate::flow::invalidation::InvalidationTracker;
use crate::flow::task_group::TaskGroup;
use crate::migration::MigrationContainer;

/// Opened connections, created on first use.
struct Pools {
    writer: Arc<tokio::sync::Mutex<Option<Connection>>>,
    /// `None` for in-memory databases; reads then go through the writer.
    readers: Mutex<Option<ReaderPool>>,
    read_permits: Arc<Semaphore>,
    /// Held shared by readers and exclusively by the writer when readers
    /// must not overlap a write.
    gate: Option<Arc<RwLock<()>>>,
}

/// Owns the database connections and the open sequence.
pub struct ConnectionManager {
    configuration: Arc<DatabaseConfiguration>,
    delegate: Arc<dyn OpenDelegate>,
    migrations: Arc<MigrationContainer>,
    tracker: Arc<InvalidationTracker>,
    context: TaskGroup,
    pools: OnceCell<Pools>,
    opening: tokio::sync::Mutex<Option<JoinHandle<Result<Pools>>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager. No connection is opened until first use.
    ///
    /// # Arguments
    ///
    /// * `configuration` - Validated database configuration
    /// * `delegate` - Schema owner driving create / migrate / open
    /// * `migrations` - User migrations merged with auto migrations
    /// * `tracker` - Tracker installed on the writer after open
    /// * `context` - Execution context for blocking SQLite work
    pub fn new(
        configuration: Arc<DatabaseConfiguration>,
        delegate: Arc<dyn OpenDelegate>,
        migrations: MigrationContainer,
        tracker: Arc<InvalidationTracker>,
        context: TaskGroup,
    ) -> Self {
        Self {
            configuration,
            delegate,
            migrations: Arc::new(migrations),
            tracker,
            context,
            pools: OnceCell::new(),
            opening: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the connections were opened successfully.
    pub fn is_opened(&self) -> bool {
        self.pools.initialized()
    }

    /// Acquire a connection and run `block` on the blocking pool.
    ///
    /// The first call opens the database. Read-only calls use a pooled
    /// reader when one exists; everything else serializes on the writer.
    /// Every committed write triggers an invalidation refresh.
    ///
    /// # Arguments
    ///
    /// * `read_only` - Whether the block only reads
    /// * `lease` - Barrier guard kept alive until the blocking work ends
    /// * `block` - Work to run with the acquired connection
    ///
    /// # Errors
    ///
    /// Returns open errors (migration, validation, hooks), pool errors,
    /// [`Error::ClosedDatabase`] after close, or the block's own error.
    pub async fn use_connection<R, F>(&self, read_only: bool, lease: BarrierGuard, block: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClosedDatabase);
        }

        let pools = self.pools.get_or_try_init(|| self.open(&lease)).await?;

        let reader = if read_only {
            pools
                .readers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            None
        };

        match reader {
            Some(reader) => self.run_on_reader(pools, reader, lease, block).await,
            None if read_only && !self.configuration.is_in_memory() => {
                // Readers were dropped by close.
                Err(Error::ClosedDatabase)
            }
            None => self.run_on_writer(pools, read_only, lease, block).await,
        }
    }

    async fn run_on_reader<R, F>(
        &self,
        pools: &Pools,
        reader: ReaderPool,
        lease: BarrierGuard,
        block: F,
    ) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        let gate = match &pools.gate {
            Some(gate) => Some(Arc::clone(gate).read_owned().await),
            None => None,
        };
        let permit = Arc::clone(&pools.read_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::ClosedDatabase)?;

        self.context
            .spawn_blocking(move || {
                let _lease = lease;
                let _gate = gate;
                let _permit = permit;
                let conn = reader.get()?;
                run_block(&conn, true, block)
            })
            .await?
    }

    async fn run_on_writer<R, F>(
        &self,
        pools: &Pools,
        read_only: bool,
        lease: BarrierGuard,
        block: F,
    ) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Transactor<'_>) -> Result<R> + Send + 'static,
    {
        let gate = match &pools.gate {
            Some(gate) => Some(Arc::clone(gate).write_owned().await),
            None => None,
        };
        let writer = Arc::clone(&pools.writer).lock_owned().await;
        let tracker = Arc::clone(&self.tracker);

        self.context
            .spawn_blocking(move || {
                // Declared first so it drops last, after the writer is released.
                let _lease = lease;
                let _gate = gate;
                let writer = writer;
                let Some(conn) = &*writer else {
                    return Err(Error::ClosedDatabase);
                };

                let result = run_block(conn, read_only, block);

                if !read_only && conn.is_autocommit() {
                    if let Err(e) = tracker.refresh(conn) {
                        tracing::warn!(error = %e, "Invalidation refresh failed");
                    }
                }
                result
            })
            .await?
    }

    /// Await the open task, spawning it if no attempt is in flight.
    ///
    /// The task holds its own barrier lease and outlives a cancelled
    /// caller; the next caller picks up the same task instead of opening
    /// again. A failed attempt is cleared so a later call retries.
    async fn open(&self, lease: &BarrierGuard) -> Result<Pools> {
        let mut opening = self.opening.lock().await;
        let task = opening.get_or_insert_with(|| {
            let open = OpenTask {
                configuration: Arc::clone(&self.configuration),
                delegate: Arc::clone(&self.delegate),
                migrations: Arc::clone(&self.migrations),
                tracker: Arc::clone(&self.tracker),
                context: self.context.clone(),
            };
            let lease = lease.share();
            self.context.spawn_uninterrupted(async move {
                let _lease = lease;
                open.run().await
            })
        });

        let result = task.await;
        *opening = None;
        result?
    }

    /// Release all connections.
    ///
    /// The writer is closed only if it is idle; a writer still held by
    /// in-flight work is closed when that work ends and the manager drops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut opening) = self.opening.try_lock() {
            // Nobody is waiting on this attempt; its connections close on drop.
            opening.take();
        }
        let Some(pools) = self.pools.get() else {
            return;
        };

        pools.read_permits.close();
        pools
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pools.writer.try_lock() {
            Ok(mut writer) => {
                if let Some(conn) = writer.take() {
                    if let Err((_, e)) = conn.close() {
                        tracing::warn!(error = %e, "Failed to close writer connection");
                    }
                }
            }
            Err(_) => tracing::warn!("Writer connection busy during close"),
        }
        tracing::debug!("Connection manager closed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.configuration.name)
            .field("opened", &self.is_opened())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Everything the open sequence needs, owned so it can run as its own task.
struct OpenTask {
    configuration: Arc<DatabaseConfiguration>,
    delegate: Arc<dyn OpenDelegate>,
    migrations: Arc<MigrationContainer>,
    tracker: Arc<InvalidationTracker>,
    context: TaskGroup,
}

impl OpenTask {
    /// Open the writer, run the schema lifecycle and build the reader pool.
    async fn run(self) -> Result<Pools> {
        let Self {
            configuration,
            delegate,
            migrations,
            tracker,
            context,
        } = self;

        let writer = context
            .spawn_blocking({
                let configuration = Arc::clone(&configuration);
                move || {
                    let helper = OpenHelper {
                        configuration: &configuration,
                        delegate: delegate.as_ref(),
                        migrations: &migrations,
                    };
                    helper.open_writer(&tracker)
                }
            })
            .await??;

        let in_memory = configuration.is_in_memory();
        let readers = match configuration.name.as_deref() {
            Some(name) if !in_memory => {
                let size = match configuration.journal_mode {
                    JournalMode::WriteAheadLogging => configuration.reader_pool_size.max(1),
                    JournalMode::Truncate => 1,
                };
                let manager = configuration.driver.reader_manager(name);
                let pool = context
                    .spawn_blocking(move || ReaderPool::new(manager, size))
                    .await??;
                Some(pool)
            }
            _ => None,
        };

        let permits = readers.as_ref().map_or(1, ReaderPool::max_size) as usize;
        let gate = (readers.is_some() && configuration.journal_mode == JournalMode::Truncate)
            .then(|| Arc::new(RwLock::new(())));

        tracing::info!(
            name = ?configuration.name,
            journal_mode = ?configuration.journal_mode,
            readers = readers.as_ref().map_or(0, ReaderPool::max_size),
            "Database opened"
        );

        Ok(Pools {
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            readers: Mutex::new(readers),
            read_permits: Arc::new(Semaphore::new(permits)),
            gate,
        })
    }
}

/// Run a user block with a fresh transactor on `conn`.
fn run_block<R, F>(conn: &Connection, read_only: bool, block: F) -> Result<R>
where
    F: FnOnce(&mut Transactor<'_>) -> Result<R>,
{
    let _scope = RollbackScope(conn);
    let mut transactor = Transactor::new(conn, read_only);
    block(&mut transactor)
}

/// Rolls back a transaction left open when a block returns or panics.
struct RollbackScope<'a>(&'a Connection);

impl Drop for RollbackScope<'_> {
    fn drop(&mut self) {
        if self.0.is_autocommit() {
            return;
        }
        tracing::warn!("Connection released inside a transaction, rolling back");
        if let Err(e) = self.0.execute_batch("ROLLBACK") {
            tracing::error!(error = %e, "Rollback on release failed");
        }
    }
}

/// Schema lifecycle for a freshly opened writer connection.
struct OpenHelper<'a> {
    configuration: &'a DatabaseConfiguration,
    delegate: &'a dyn OpenDelegate,
    migrations: &'a MigrationContainer,
}

impl OpenHelper<'_> {
    fn open_writer(&self, tracker: &InvalidationTracker) -> Result<Connection> {
        let configuration = self.configuration;
        let conn = configuration.driver.open(configuration.name.as_deref())?;
        apply_writer_pragmas(&conn, configuration.journal_mode, configuration.is_in_memory())?;

        self.configure(&conn)?;
        self.on_open(&conn)?;
        tracker.install(&conn)?;
        Ok(conn)
    }

    /// Bring the stored schema to the delegate's version.
    fn configure(&self, conn: &Connection) -> Result<()> {
        let current = user_version(conn)?;
        let target = self.delegate.version();
        if current == target {
            return Ok(());
        }

        tracing::info!(from = current, to = target, "Schema version change");

        Transactor::new(conn, false)
            .with_transaction(TransactionType::Exclusive, |tx| {
                let conn = tx.connection();
                // Another connection may have finished the change while this
                // one waited for the lock.
                let current = user_version(conn)?;
                if current == target {
                    tracing::debug!(version = target, "Schema already at target version");
                    return Ok(());
                }
                if current == 0 {
                    self.on_create(conn)?;
                } else {
                    self.on_migrate(conn, current, target)?;
                }
                set_user_version(conn, target)?;
                Ok(())
            })
            .map_err(|e| match e {
                Error::TransactionAborted(inner) => *inner,
                other => other,
            })
    }

    fn on_create(&self, conn: &Connection) -> Result<()> {
        let was_empty = has_empty_schema(conn)?;
        self.delegate
            .create_all_tables(conn)
            .map_err(|e| Error::hook("create_all_tables", e))?;

        if !was_empty {
            let result = self.delegate.on_validate_schema(conn);
            if !result.is_valid {
                return Err(Error::SchemaValidation(format!(
                    "Pre-packaged database has an invalid schema: {}",
                    result.expected_found_msg.unwrap_or_default()
                )));
            }
        }

        write_identity(conn, self.delegate.identity_hash())?;
        self.delegate
            .on_create(conn)
            .map_err(|e| Error::hook("on_create", e))?;
        self.invoke_create_callbacks(conn)
    }

    fn on_migrate(&self, conn: &Connection, from: u32, to: u32) -> Result<()> {
        match self.migrations.find_path(from, to) {
            Ok(path) => {
                self.delegate
                    .on_pre_migrate(conn)
                    .map_err(|e| Error::hook("on_pre_migrate", e))?;
                for migration in &path {
                    tracing::debug!(
                        start = migration.start_version(),
                        end = migration.end_version(),
                        "Applying migration"
                    );
                    migration.apply(conn)?;
                }

                let result = self.delegate.on_validate_schema(conn);
                if !result.is_valid {
                    return Err(Error::SchemaValidation(format!(
                        "Migration didn't properly handle: {}",
                        result.expected_found_msg.unwrap_or_default()
                    )));
                }

                self.delegate
                    .on_post_migrate(conn)
                    .map_err(|e| Error::hook("on_post_migrate", e))?;
                write_identity(conn, self.delegate.identity_hash())?;
                tracing::info!(from, to, steps = path.len(), "Migration complete");
                Ok(())
            }
            Err(_) if self.configuration.is_migration_required(from, to) => {
                if from > to {
                    Err(Error::SchemaDowngrade { from, to })
                } else {
                    Err(Error::MigrationMissing { from, to })
                }
            }
            Err(_) => self.recreate(conn, from, to),
        }
    }

    /// Drop the schema and create it again from the delegate.
    fn recreate(&self, conn: &Connection, from: u32, to: u32) -> Result<()> {
        tracing::warn!(from, to, "No migration path, recreating database");

        if self.configuration.allow_destructive_migration_for_all_tables {
            drop_all_user_tables(conn)?;
        } else {
            self.delegate
                .drop_all_tables(conn)
                .map_err(|e| Error::hook("drop_all_tables", e))?;
        }

        self.delegate
            .create_all_tables(conn)
            .map_err(|e| Error::hook("create_all_tables", e))?;
        write_identity(conn, self.delegate.identity_hash())?;
        self.delegate
            .on_create(conn)
            .map_err(|e| Error::hook("on_create", e))?;
        self.invoke_create_callbacks(conn)?;

        for callback in &self.configuration.callbacks {
            callback
                .on_destructive_migration(conn)
                .map_err(|e| Error::hook("on_destructive_migration", e))?;
        }
        Ok(())
    }

    fn invoke_create_callbacks(&self, conn: &Connection) -> Result<()> {
        for callback in &self.configuration.callbacks {
            callback
                .on_create(conn)
                .map_err(|e| Error::hook("on_create", e))?;
        }
        Ok(())
    }

    /// Verify the stored identity, then run open hooks.
    fn on_open(&self, conn: &Connection) -> Result<()> {
        let expected = self.delegate.identity_hash();
        match read_identity(conn)? {
            Some(found) if found != expected => {
                return Err(Error::IdentityMismatch {
                    expected: expected.to_string(),
                    found,
                });
            }
            Some(_) => {}
            None => {
                let result = self.delegate.on_validate_schema(conn);
                if !result.is_valid {
                    return Err(Error::SchemaValidation(format!(
                        "Pre-packaged database has an invalid schema: {}",
                        result.expected_found_msg.unwrap_or_default()
                    )));
                }
                write_identity(conn, expected)?;
            }
        }

        self.delegate
            .on_open(conn)
            .map_err(|e| Error::hook("on_open", e))?;
        for callback in &self.configuration.callbacks {
            callback
                .on_open(conn)
                .map_err(|e| Error::hook("on_open", e))?;
        }
        Ok(())
    }
}

/// Whether the main schema holds no objects at all.
fn has_empty_schema(conn: &Connection) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
    Ok(count == 0)
}
