//! Vessel: an embedded SQLite database runtime with managed schema lifecycle.
//!
//! Vessel opens a SQLite database on first use and brings it to the schema
//! version its [`OpenDelegate`] declares, by running registered migrations
//! or, when allowed, recreating it destructively. Callers then borrow
//! connections asynchronously and observe table changes.
//!
//! # Architecture
//!
//! - **Lazy open**: The first connection use creates, migrates or validates
//!   the schema inside one exclusive transaction
//! - **Single writer, pooled readers**: Writes serialize on one connection;
//!   reads run concurrently under WAL
//! - **Invalidation**: Temporary triggers record table changes, observers
//!   are notified after each committed write
//! - **Graceful close**: Close rejects new work at once and releases
//!   connections when in-flight work drains
//!
//! # Modules
//!
//! - [`config`]: Builder and immutable database configuration
//! - [`converters`]: Type converter registry
//! - [`database`]: The [`Database`] handle
//! - [`delegate`]: Schema owner and lifecycle callback traits
//! - [`error`]: Error types
//! - [`flow`]: Close barrier, task group and invalidation tracker
//! - [`migration`]: Migrations and path resolution
//! - [`observability`]: Tracing setup
//! - [`storage`]: SQLite connections, pragmas and transactions

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // migration::MigrationContainer is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod converters;
pub mod database;
pub mod delegate;
pub mod error;
pub mod flow;
pub mod migration;
pub mod observability;
pub mod storage;

pub use config::{Builder, DatabaseConfiguration, JournalMode};
pub use converters::{TypeConverter, TypeConverters};
pub use database::Database;
pub use delegate::{AutoMigrationSpec, AutoMigrationSpecs, Callback, OpenDelegate, ValidationResult};
pub use error::{ConfigurationError, Error, Result};
pub use flow::invalidation::{InvalidationSubscription, InvalidationTracker, ObserverHandle};
pub use migration::{Migration, MigrationContainer};
pub use storage::driver::{Driver, SqliteDriver};
pub use storage::transactor::{TransactionType, Transactor};

/// Re-exported so callers can name connection types without a direct
/// dependency.
pub use rusqlite;
