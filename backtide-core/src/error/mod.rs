//! Error handling for Backtide
//!
//! ## Error Categories
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Backtide Error Taxonomy                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Storage              │  Remote               │  Logic       │
//! │  • redb txn/table     │  • Network            │  • Config    │
//! │  • JSON               │  • HTTP status        │  • Validate  │
//! │  • IO                 │  • Authentication     │  • Usage     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Transient (retried by the remote adapter)                   │
//! │  • TemporaryFailure (5xx, timeouts) • NetworkError • Timeout │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient errors are retried at a fixed interval by the remote object
//! store client; everything else fails the current request immediately.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{BacktideError, BacktideResult};
