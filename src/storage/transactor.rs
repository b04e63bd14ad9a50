//! Reentrant transaction execution over one acquired connection.
//!
//! Nested `with_transaction` calls join the outermost transaction instead of
//! opening a new one. A failure at any depth marks the transaction
//! rollback-only, so the outermost call performs exactly one COMMIT or one
//! ROLLBACK.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// How the outermost transaction acquires its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionType {
    /// Locks are taken on first read or write.
    #[default]
    Deferred,
    /// The write lock is taken immediately.
    Immediate,
    /// No other connection may read or write until the transaction ends.
    Exclusive,
}

impl TransactionType {
    fn begin_sql(self) -> &'static str {
        match self {
            TransactionType::Deferred => "BEGIN DEFERRED",
            TransactionType::Immediate => "BEGIN IMMEDIATE",
            TransactionType::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Transaction scope bound to one connection for the duration of a
/// `use_connection` block.
pub struct Transactor<'c> {
    conn: &'c Connection,
    read_only: bool,
    depth: u32,
    rollback_only: bool,
}

impl<'c> Transactor<'c> {
    pub(crate) fn new(conn: &'c Connection, read_only: bool) -> Self {
        Self {
            conn,
            read_only,
            depth: 0,
            rollback_only: false,
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Whether this transactor was acquired for reading only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether a transaction opened by this transactor is active.
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Run `block` inside a transaction.
    ///
    /// Read-only transactors always begin deferred transactions.
    ///
    /// # Errors
    ///
    /// The outermost call returns [`Error::TransactionAborted`] wrapping the
    /// block's error after rolling back. Nested calls return the block's
    /// error unchanged.
    pub fn with_transaction<R, F>(&mut self, kind: TransactionType, block: F) -> Result<R>
    where
        F: FnOnce(&mut Transactor<'c>) -> Result<R>,
    {
        if self.depth > 0 {
            self.depth += 1;
            let result = block(self);
            self.depth -= 1;
            if result.is_err() {
                self.rollback_only = true;
            }
            return result;
        }

        let kind = if self.read_only {
            TransactionType::Deferred
        } else {
            kind
        };
        self.conn.execute_batch(kind.begin_sql())?;
        self.depth = 1;
        self.rollback_only = false;

        let result = block(self);
        self.depth = 0;

        match result {
            Ok(value) if !self.rollback_only => {
                if let Err(err) = self.conn.execute_batch("COMMIT") {
                    self.rollback();
                    return Err(Error::from(err).into_aborted());
                }
                Ok(value)
            }
            Ok(_) => {
                self.rollback();
                Err(Error::RollbackOnly.into_aborted())
            }
            Err(err) => {
                self.rollback();
                Err(err.into_aborted())
            }
        }
    }

    fn rollback(&mut self) {
        self.rollback_only = false;
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!(error = %err, "Failed to roll back transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_commit_on_success() {
        let conn = setup();
        let mut transactor = Transactor::new(&conn, false);

        let id = transactor
            .with_transaction(TransactionType::Immediate, |tx| {
                assert!(tx.in_transaction());
                tx.connection()
                    .execute("INSERT INTO items (name) VALUES ('a')", [])?;
                Ok(tx.connection().last_insert_rowid())
            })
            .unwrap();

        assert_eq!(id, 1);
        assert!(!transactor.in_transaction());
        assert!(conn.is_autocommit());
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn test_rollback_on_error() {
        let conn = setup();
        let mut transactor = Transactor::new(&conn, false);

        let err = transactor
            .with_transaction(TransactionType::Deferred, |tx| {
                tx.connection()
                    .execute("INSERT INTO items (name) VALUES ('a')", [])?;
                tx.connection().execute("INSERT INTO missing VALUES (1)", [])?;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::TransactionAborted(_)));
        assert!(conn.is_autocommit());
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_nested_calls_share_one_transaction() {
        let conn = setup();
        let mut transactor = Transactor::new(&conn, false);

        transactor
            .with_transaction(TransactionType::Immediate, |tx| {
                tx.connection()
                    .execute("INSERT INTO items (name) VALUES ('outer')", [])?;
                tx.with_transaction(TransactionType::Exclusive, |inner| {
                    inner
                        .connection()
                        .execute("INSERT INTO items (name) VALUES ('inner')", [])?;
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn test_swallowed_nested_failure_rolls_back() {
        let conn = setup();
        let mut transactor = Transactor::new(&conn, false);

        let err = transactor
            .with_transaction(TransactionType::Immediate, |tx| {
                tx.connection()
                    .execute("INSERT INTO items (name) VALUES ('outer')", [])?;
                let nested = tx.with_transaction(TransactionType::Deferred, |_| {
                    Err::<(), _>(Error::SchemaValidation("nested".into()))
                });
                assert!(matches!(nested, Err(Error::SchemaValidation(_))));
                Ok(())
            })
            .unwrap_err();

        match err {
            Error::TransactionAborted(inner) => assert!(matches!(*inner, Error::RollbackOnly)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_transactor_reusable_after_abort() {
        let conn = setup();
        let mut transactor = Transactor::new(&conn, false);

        let _ = transactor.with_transaction(TransactionType::Deferred, |_| {
            Err::<(), _>(Error::SchemaValidation("first".into()))
        });
        transactor
            .with_transaction(TransactionType::Deferred, |tx| {
                tx.connection()
                    .execute("INSERT INTO items (name) VALUES ('b')", [])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(count(&conn), 1);
    }
}
