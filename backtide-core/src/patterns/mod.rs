//! Reusable resilience patterns

pub mod retry;

pub use retry::{retry, RetryConfig};
