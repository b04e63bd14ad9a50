//! Error types for Vessel.
//!
//! A single [`Error`] enum covers every failure a caller can observe:
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Configuration | [`Error::Configuration`] | Fix the builder and rebuild |
//! | Schema | [`Error::MigrationMissing`], [`Error::SchemaDowngrade`], [`Error::SchemaValidation`], [`Error::IdentityMismatch`] | Add migrations or allow destructive fallback |
//! | Lifecycle | [`Error::ClosedDatabase`] | Stop using the database |
//! | Transaction | [`Error::TransactionAborted`] | Caller decides whether to retry |
//! | Internal | [`Error::Sqlite`], [`Error::Pool`], [`Error::TaskJoin`] | Log and investigate |
//!
//! User-supplied code (migrations, delegate hooks, observers) returns
//! `anyhow::Result<()>`; failures are wrapped so the original error stays
//! reachable through [`std::error::Error::source`].

use thiserror::Error;

/// Build-time misconfiguration detected by `Builder::build`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("cannot create a database without a driver, call set_driver() first")]
    MissingDriver,

    #[error("no query execution context was set and no tokio runtime is running")]
    MissingExecutionContext,

    #[error(
        "inconsistency detected: a migration was provided that starts or ends at version \
         {version}, but the same version is also listed in fallback_to_destructive_migration_from()"
    )]
    OverlappingVersion { version: u32 },

    #[error("a required auto migration spec ({tag}) is missing in the database configuration")]
    MissingAutoMigrationSpec { tag: &'static str },

    #[error("unexpected auto migration spec ({tag}), it is not required by any auto migration")]
    UnexpectedAutoMigrationSpec { tag: &'static str },

    #[error("a required type converter ({tag}) for {dao} is missing in the database configuration")]
    MissingTypeConverter { dao: &'static str, tag: &'static str },

    #[error("unexpected type converter ({tag}), it is not required by any DAO")]
    UnexpectedTypeConverter { tag: &'static str },
}

/// All errors that can occur in Vessel operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid database configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// No migration path exists and destructive recreation is not allowed.
    #[error(
        "a migration from {from} to {to} was required but not found, add a migration or \
         enable destructive fallback in the builder"
    )]
    MigrationMissing { from: u32, to: u32 },

    /// Stored schema is newer than the target and downgrades are not allowed.
    #[error(
        "cannot downgrade database from version {from} to {to}, add a migration or enable \
         fallback_to_destructive_migration_on_downgrade()"
    )]
    SchemaDowngrade { from: u32, to: u32 },

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// The identity hash stored on disk does not match the expected one.
    #[error(
        "cannot verify the data integrity: schema changed without a version bump \
         (expected identity {expected}, found {found})"
    )]
    IdentityMismatch { expected: String, found: String },

    #[error("cannot perform this operation because the database is closed")]
    ClosedDatabase,

    /// The outermost transaction was rolled back.
    #[error("transaction aborted: {0}")]
    TransactionAborted(#[source] Box<Error>),

    /// A nested transaction block failed but the outer block returned normally.
    #[error("a nested transaction block failed, the transaction was marked rollback-only")]
    RollbackOnly,

    #[error("there is no table or view with name {0}")]
    UnknownTable(String),

    #[error("migration {start} -> {end} failed: {source}")]
    Migration {
        start: u32,
        end: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{hook} hook failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Wrap a user hook failure.
    pub(crate) fn hook(hook: &'static str, source: anyhow::Error) -> Self {
        Error::Hook { hook, source }
    }

    /// Convert a failed outermost transaction into [`Error::TransactionAborted`].
    ///
    /// Errors that are already aborted are passed through unchanged.
    pub(crate) fn into_aborted(self) -> Self {
        match self {
            Error::TransactionAborted(_) | Error::ClosedDatabase => self,
            other => Error::TransactionAborted(Box::new(other)),
        }
    }

    /// Returns true if this error was produced because the database is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ClosedDatabase)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            std::panic::resume_unwind(err.into_panic());
        }
        Error::TaskJoin(err.to_string())
    }
}

/// Result alias used throughout Vessel.
pub type Result<T> = std::result::Result<T, Error>;
