//! Lifecycle and notification infrastructure.
//!
//! Provides:
//! - Close barrier deferring teardown until in-flight work drains
//! - Task group scoping background work to the database lifetime
//! - Invalidation tracker notifying observers of table changes

pub mod barrier;
pub mod invalidation;
pub mod task_group;
