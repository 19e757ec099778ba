//! # warden-core
//!
//! Core types, errors, and utilities for the Warden worker supervisor.
//!
//! This crate provides:
//! - [`WardenError`] - Error type for every supervisor and worker failure path
//! - [`logging`] - Tracing setup and log management utilities
//! - [`types`] - Shared type definitions used across Warden crates
//!
//! ## Example
//!
//! ```no_run
//! use warden_core::{ErrorKind, WardenError, logging};
//!
//! fn main() -> warden_core::Result<()> {
//!     // Initialize logging
//!     let _guard = logging::init_logging(None, 0)?;
//!
//!     let err = WardenError::timeout("req-1", 5_000);
//!     assert_eq!(err.kind(), ErrorKind::Timeout);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use error::{ErrorKind, Result, WardenError};
pub use logging::{LogGuard, init_logging};
pub use types::{Component, LifecycleState, Priority};
