//! Table invalidation tracking.
//!
//! Per-table version counters live in a temp table on the writer connection,
//! maintained by temp triggers on every tracked table. After a write commits,
//! the connection manager calls [`InvalidationTracker::refresh`], which diffs
//! the counters against the last seen values and queues the changed tables.
//! One notification pass is scheduled on the database's [`TaskGroup`]; more
//! changes arriving before it runs are merged into the same pass.

use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::barrier::CloseBarrier;
use super::task_group::TaskGroup;
use crate::error::{Error, Result};
use crate::storage::schema::{quote_identifier, table_exists};

const MODIFICATION_LOG_TABLE: &str = "vessel_table_modification_log";
const TRIGGER_OPERATIONS: [&str; 3] = ["INSERT", "UPDATE", "DELETE"];

type ObserverFn = dyn Fn(&BTreeSet<String>) -> anyhow::Result<()> + Send + Sync;

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    id: Uuid,
}

impl ObserverHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

struct ObserverEntry {
    /// Requested names paired with the tables they resolve to.
    watched: Vec<(String, BTreeSet<String>)>,
    callback: Arc<ObserverFn>,
}

impl ObserverEntry {
    /// Requested names whose underlying tables intersect `changed`.
    fn matching(&self, changed: &BTreeSet<String>) -> BTreeSet<String> {
        self.watched
            .iter()
            .filter(|(_, tables)| !tables.is_disjoint(changed))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[derive(Default)]
struct PassState {
    pending: BTreeSet<String>,
    scheduled: bool,
}

/// Notifies observers when the tables they watch are modified.
pub struct InvalidationTracker {
    /// Tracked table names (lowercase); the index is the table id.
    tables: Vec<String>,
    table_ids: HashMap<String, usize>,
    view_tables: HashMap<String, BTreeSet<String>>,
    observers: RwLock<HashMap<Uuid, Arc<ObserverEntry>>>,
    last_versions: Mutex<Vec<i64>>,
    pass: Mutex<PassState>,
    installed: AtomicBool,
    stopped: AtomicBool,
    context: TaskGroup,
    barrier: Arc<CloseBarrier>,
}

impl InvalidationTracker {
    /// Create a tracker for the given tables and views.
    ///
    /// # Arguments
    ///
    /// * `tables` - Table names to track
    /// * `view_tables` - Map of view name to the tables it reads
    /// * `context` - Execution context for notification passes
    /// * `barrier` - Close barrier entered by every pass
    pub fn new(
        tables: Vec<String>,
        view_tables: HashMap<String, Vec<String>>,
        context: TaskGroup,
        barrier: Arc<CloseBarrier>,
    ) -> Self {
        let mut names = Vec::with_capacity(tables.len());
        let mut table_ids = HashMap::with_capacity(tables.len());
        for table in tables {
            let table = table.to_lowercase();
            if !table_ids.contains_key(&table) {
                table_ids.insert(table.clone(), names.len());
                names.push(table);
            }
        }

        let view_tables = view_tables
            .into_iter()
            .map(|(view, tables)| {
                (
                    view.to_lowercase(),
                    tables.into_iter().map(|t| t.to_lowercase()).collect(),
                )
            })
            .collect();

        Self {
            last_versions: Mutex::new(vec![0; names.len()]),
            tables: names,
            table_ids,
            view_tables,
            observers: RwLock::new(HashMap::new()),
            pass: Mutex::new(PassState::default()),
            installed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            context,
            barrier,
        }
    }

    /// Register a callback for changes to any of `tables`.
    ///
    /// Names are case-insensitive; a view name watches the tables the view
    /// reads. The callback receives the requested names that changed and is
    /// called at most once per notification pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if a name is neither a tracked table
    /// nor a known view.
    pub fn observe<F>(&self, tables: &[&str], callback: F) -> Result<ObserverHandle>
    where
        F: Fn(&BTreeSet<String>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let watched = tables
            .iter()
            .map(|name| Ok((name.to_lowercase(), self.resolve(name)?)))
            .collect::<Result<Vec<_>>>()?;

        let handle = ObserverHandle { id: Uuid::now_v7() };
        let entry = Arc::new(ObserverEntry {
            watched,
            callback: Arc::new(callback),
        });
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id, entry);

        tracing::debug!(observer = %handle.id, tables = ?tables, "Observer registered");
        Ok(handle)
    }

    /// Register a channel-backed observer.
    ///
    /// Each notification pass that touches `tables` sends the changed names.
    pub fn subscribe(&self, tables: &[&str]) -> Result<InvalidationSubscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self.observe(tables, move |changed| {
            // A dropped receiver only means nobody listens anymore.
            let _ = sender.send(changed.clone());
            Ok(())
        })?;
        Ok(InvalidationSubscription { handle, receiver })
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, handle: &ObserverHandle) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id)
            .is_some()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Mark tables as changed without a local write, e.g. after another
    /// process modified the database.
    pub fn notify_tables(self: &Arc<Self>, tables: &[&str]) -> Result<()> {
        let mut changed = BTreeSet::new();
        for name in tables {
            changed.extend(self.resolve(name)?);
        }
        self.enqueue(changed);
        Ok(())
    }

    /// Stop tracking. Scheduled passes are dropped and later writes are
    /// ignored.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        pass.pending.clear();
        tracing::debug!("Invalidation tracker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Tracked table names, lowercase.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Create the modification log and triggers on the writer connection.
    pub(crate) fn install(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TEMP TABLE IF NOT EXISTS {MODIFICATION_LOG_TABLE} \
             (table_id INTEGER PRIMARY KEY, version INTEGER NOT NULL DEFAULT 0)"
        ))?;

        for (table_id, table) in self.tables.iter().enumerate() {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {MODIFICATION_LOG_TABLE} (table_id, version) \
                     VALUES (?1, 0)"
                ),
                [table_id as i64],
            )?;

            if !table_exists(conn, table)? {
                tracing::debug!(table = %table, "Skipping triggers for missing table");
                continue;
            }

            for operation in TRIGGER_OPERATIONS {
                let trigger =
                    quote_identifier(&format!("vessel_table_modification_trigger_{table}_{operation}"));
                conn.execute_batch(&format!(
                    "CREATE TEMP TRIGGER IF NOT EXISTS {trigger} AFTER {operation} ON {} \
                     BEGIN UPDATE {MODIFICATION_LOG_TABLE} SET version = version + 1 \
                     WHERE table_id = {table_id}; END",
                    quote_identifier(table)
                ))?;
            }
        }

        let current = read_versions(conn, self.tables.len())?;
        *self
            .last_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = current;
        self.installed.store(true, Ordering::SeqCst);

        tracing::debug!(tables = self.tables.len(), "Invalidation triggers installed");
        Ok(())
    }

    /// Detect tables changed since the last refresh and schedule a pass.
    ///
    /// Called on the writer connection after a write committed.
    pub(crate) fn refresh(self: &Arc<Self>, conn: &Connection) -> Result<()> {
        if self.is_stopped() || !self.installed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let current = read_versions(conn, self.tables.len())?;
        let changed: BTreeSet<String> = {
            let mut last = self
                .last_versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = current
                .iter()
                .zip(last.iter())
                .enumerate()
                .filter(|(_, (now, before))| now != before)
                .map(|(table_id, _)| self.tables[table_id].clone())
                .collect();
            *last = current;
            changed
        };

        self.enqueue(changed);
        Ok(())
    }

    fn enqueue(self: &Arc<Self>, changed: BTreeSet<String>) {
        if changed.is_empty() || self.is_stopped() {
            return;
        }

        let mut pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        pass.pending.extend(changed);
        if pass.scheduled {
            return;
        }

        let tracker = Arc::clone(self);
        if self
            .context
            .spawn(async move { tracker.run_pass() })
            .is_some()
        {
            pass.scheduled = true;
        }
    }

    fn run_pass(&self) {
        let Some(_guard) = self.barrier.guard() else {
            return;
        };
        if self.is_stopped() {
            return;
        }

        let pending = {
            let mut pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
            pass.scheduled = false;
            std::mem::take(&mut pass.pending)
        };
        if pending.is_empty() {
            return;
        }

        let observers: Vec<(Uuid, Arc<ObserverEntry>)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        tracing::debug!(tables = ?pending, observers = observers.len(), "Running notification pass");

        for (id, entry) in observers {
            let matched = entry.matching(&pending);
            if matched.is_empty() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (entry.callback)(&matched))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(observer = %id, error = %err, "Observer callback failed");
                }
                Err(_) => {
                    tracing::warn!(observer = %id, "Observer callback panicked");
                }
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<BTreeSet<String>> {
        let lower = name.to_lowercase();
        if self.table_ids.contains_key(&lower) {
            return Ok(BTreeSet::from([lower]));
        }
        self.view_tables
            .get(&lower)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

impl std::fmt::Debug for InvalidationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationTracker")
            .field("tables", &self.tables)
            .field("observers", &self.observer_count())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

fn read_versions(conn: &Connection, len: usize) -> Result<Vec<i64>> {
    let mut versions = vec![0; len];
    let mut stmt = conn.prepare(&format!(
        "SELECT table_id, version FROM {MODIFICATION_LOG_TABLE}"
    ))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (table_id, version) = row?;
        if let Some(slot) = usize::try_from(table_id)
            .ok()
            .and_then(|id| versions.get_mut(id))
        {
            *slot = version;
        }
    }
    Ok(versions)
}

/// Channel-backed observer created by [`InvalidationTracker::subscribe`].
#[derive(Debug)]
pub struct InvalidationSubscription {
    handle: ObserverHandle,
    receiver: mpsc::UnboundedReceiver<BTreeSet<String>>,
}

impl InvalidationSubscription {
    pub fn handle(&self) -> ObserverHandle {
        self.handle
    }

    /// Wait for the next set of changed names.
    pub async fn recv(&mut self) -> Option<BTreeSet<String>> {
        self.receiver.recv().await
    }

    /// Take a pending notification without waiting.
    pub fn try_recv(&mut self) -> Option<BTreeSet<String>> {
        self.receiver.try_recv().ok()
    }
}
