//! SQLite storage layer for Vessel.
//!
//! Provides:
//! - Driver abstraction for opening connections
//! - Schema bookkeeping (pragmas, `user_version`, identity hash)
//! - Connection manager with the open / migrate sequence
//! - Read connection pool for concurrent readers
//! - Reentrant transactions over one acquired connection

pub mod driver;
pub mod manager;
pub mod reader;
pub mod schema;
pub mod transactor;
