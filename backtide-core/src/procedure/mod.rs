//! Backup procedure: the state machine that drains the change log into the
//! active backend
//!
//! ```text
//! preparing ──► synching ◄──► paused
//!                  │             │
//!                  ▼             ▼
//!            done | failed    cancelled
//! ```

pub mod backup;
pub mod control;

pub use backup::{BackupProcedure, ProcedureConfig};
pub use control::{BackupEvent, BackupRun, RunControl, RunOutcome};
