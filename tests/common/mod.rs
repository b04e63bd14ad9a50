//! Test utilities for Vessel integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - A configurable schema delegate that records lifecycle events
//! - A recording lifecycle callback
//! - Polling helper for asynchronous assertions

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use vessel::observability::tracing::init_test_tracing;
use vessel::rusqlite::Connection;
use vessel::{
    AutoMigrationSpecs, Builder, Callback, Database, Migration, OpenDelegate, SqliteDriver,
    ValidationResult,
};

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    /// Get the database path as a string.
    pub fn db_path_str(&self) -> &str {
        self.db_path.to_str().expect("invalid path")
    }

    /// Builder for a file database at the fixture path with the SQLite driver.
    pub fn builder(&self, delegate: TestDelegate) -> Builder {
        Database::builder(Some(self.db_path_str()), delegate).set_driver(SqliteDriver)
    }

    /// Read `user_version` straight from the file.
    pub fn stored_version(&self) -> u32 {
        let conn = Connection::open(&self.db_path).expect("open db");
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("user_version")
    }

    /// Run raw SQL against the file outside of Vessel.
    pub fn execute(&self, sql: &str) {
        let conn = Connection::open(&self.db_path).expect("open db");
        conn.execute_batch(sql).expect("execute sql");
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, ordered record of lifecycle events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

type AutoMigrationFactory = Arc<dyn Fn(&AutoMigrationSpecs) -> Vec<Migration> + Send + Sync>;

/// Schema delegate declaring a set of tables at a fixed version.
#[derive(Clone)]
pub struct TestDelegate {
    pub version: u32,
    pub identity: String,
    /// `(name, CREATE statement)` pairs.
    pub tables: Vec<(String, String)>,
    pub views: Vec<(String, String, Vec<String>)>,
    pub events: EventLog,
    pub required_specs: Vec<&'static str>,
    pub auto_migrations: Option<AutoMigrationFactory>,
    pub required_converters: HashMap<&'static str, Vec<&'static str>>,
}

impl TestDelegate {
    /// Delegate with `users` and `posts` tables at `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            identity: format!("identity-v{version}"),
            tables: Vec::new(),
            views: Vec::new(),
            events: EventLog::default(),
            required_specs: Vec::new(),
            auto_migrations: None,
            required_converters: HashMap::new(),
        }
        .with_table(
            "users",
            "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        )
        .with_table(
            "posts",
            "CREATE TABLE IF NOT EXISTS posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT)",
        )
    }

    pub fn with_table(mut self, name: &str, create_sql: &str) -> Self {
        self.tables.push((name.to_string(), create_sql.to_string()));
        self
    }

    pub fn with_view(mut self, name: &str, create_sql: &str, tables: &[&str]) -> Self {
        self.views.push((
            name.to_string(),
            create_sql.to_string(),
            tables.iter().map(|t| (*t).to_string()).collect(),
        ));
        self
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }
}

impl OpenDelegate for TestDelegate {
    fn version(&self) -> u32 {
        self.version
    }

    fn identity_hash(&self) -> &str {
        &self.identity
    }

    fn create_all_tables(&self, conn: &Connection) -> anyhow::Result<()> {
        for (_, sql) in &self.tables {
            conn.execute_batch(sql)?;
        }
        for (_, sql, _) in &self.views {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    fn drop_all_tables(&self, conn: &Connection) -> anyhow::Result<()> {
        self.events.push("delegate.drop_all_tables");
        for (name, _, _) in &self.views {
            conn.execute_batch(&format!("DROP VIEW IF EXISTS {name}"))?;
        }
        for (name, _) in &self.tables {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {name}"))?;
        }
        Ok(())
    }

    fn on_validate_schema(&self, conn: &Connection) -> ValidationResult {
        let missing: Vec<&str> = self
            .tables
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [name],
                    |row| row.get::<_, i64>(0),
                )
                .map_or(true, |count| count == 0)
            })
            .collect();

        if missing.is_empty() {
            ValidationResult::valid()
        } else {
            ValidationResult::invalid(format!("missing tables: {}", missing.join(", ")))
        }
    }

    fn on_create(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("delegate.on_create");
        Ok(())
    }

    fn on_open(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("delegate.on_open");
        Ok(())
    }

    fn on_pre_migrate(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("delegate.on_pre_migrate");
        Ok(())
    }

    fn on_post_migrate(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("delegate.on_post_migrate");
        Ok(())
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|(name, _)| name.clone()).collect()
    }

    fn view_tables(&self) -> HashMap<String, Vec<String>> {
        self.views
            .iter()
            .map(|(name, _, tables)| (name.clone(), tables.clone()))
            .collect()
    }

    fn required_auto_migration_specs(&self) -> Vec<&'static str> {
        self.required_specs.clone()
    }

    fn create_auto_migrations(&self, specs: &AutoMigrationSpecs) -> Vec<Migration> {
        self.auto_migrations
            .as_ref()
            .map(|factory| factory(specs))
            .unwrap_or_default()
    }

    fn required_type_converters(&self) -> HashMap<&'static str, Vec<&'static str>> {
        self.required_converters.clone()
    }
}

/// Lifecycle callback that records every invocation.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    pub events: EventLog,
}

impl Callback for RecordingCallback {
    fn on_create(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("callback.on_create");
        Ok(())
    }

    fn on_destructive_migration(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("callback.on_destructive_migration");
        Ok(())
    }

    fn on_open(&self, _conn: &Connection) -> anyhow::Result<()> {
        self.events.push("callback.on_open");
        Ok(())
    }
}

/// Create the database at `delegate`'s version, then close it.
pub async fn create_at(fixture: &TestFixture, delegate: TestDelegate) {
    let db = fixture.builder(delegate).build().unwrap();
    db.use_writer_connection(|_| Ok(())).await.unwrap();
    db.close();
}

/// Version 2 delegate that adds a `tags` table.
pub fn tags_delegate() -> TestDelegate {
    TestDelegate::new(2).with_table(
        "tags",
        "CREATE TABLE IF NOT EXISTS tags (id INTEGER PRIMARY KEY, label TEXT)",
    )
}

/// Migration 1 -> 2 creating `tags` after `hold`, counting every run.
///
/// A second run fails because the table already exists.
pub fn slow_tags_migration(runs: Arc<AtomicUsize>, hold: Duration) -> Migration {
    Migration::new(1, 2, move |conn| {
        runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(hold);
        conn.execute_batch("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT)")?;
        Ok(())
    })
}

/// Count rows in `table` through a reader connection.
pub async fn count_rows(db: &Database, table: &'static str) -> vessel::Result<i64> {
    db.use_reader_connection(move |tx| {
        Ok(tx
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    })
    .await
}

/// Wait for a condition to become true with timeout.
///
/// # Arguments
///
/// * `timeout` - Maximum time to wait
/// * `condition` - Closure that returns true when condition is met
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: std::time::Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
