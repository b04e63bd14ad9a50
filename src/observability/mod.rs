//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing setup for applications and tests

pub mod tracing;
