//! Incremental backup engine
//!
//! Local writes are recorded into an ordered change log by a storage hook.
//! A backup run drains the log up to a cut-off, hydrates each change with
//! the current object, and hands batches to a pluggable [`backend`]. Each
//! batch is forgotten only after the backend accepted it, so every change
//! is delivered at least once.

pub mod abstractions;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod module;
pub mod notifications;
pub mod patterns;
pub mod procedure;
pub mod storage;
pub mod types;

pub use error::{BacktideError, BacktideResult};
pub use module::{BackupModule, ModuleDependencies};
