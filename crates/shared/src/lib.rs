//! Shared library for the MoveOn video analysis workspace.
//!
//! This crate provides common functionality used across the analysis crates:
//! - Configuration management
//! - Report and job data models
//! - The append-only event log and its storage backends
//! - File path utilities
//! - Logging infrastructure

pub mod config;
pub mod event_log;
pub mod logging;
pub mod models;
pub mod paths;

// Re-export commonly used types
pub use config::Config;
pub use event_log::{open_event_log, EventLog, JsonlEventLog, MemoryEventLog, SqliteEventLog};
pub use logging::LogConfig;
pub use models::*;
pub use paths::DataPaths;

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
