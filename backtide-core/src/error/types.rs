//! Core error types for Backtide
//!
//! This module contains the main BacktideError enum with all error variants
//! and the result alias used across the workspace.

use thiserror::Error;

/// Error type for every Backtide operation
///
/// # Error Categories
///
/// - **Storage Errors**: redb failures in the object store, change log or settings
/// - **Remote Errors**: HTTP transport failures and non-success statuses
/// - **Authentication Errors**: missing credentials or a failed token refresh
/// - **Logic Errors**: configuration, validation and usage mistakes
/// - **Operational Errors**: timeouts and procedures in the wrong state
#[derive(Error, Debug)]
pub enum BacktideError {
    // Storage Errors
    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Database error: {operation} failed")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Serialization & IO Errors
    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    // Network & Remote Errors
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request '{operation}' returned HTTP {status}")]
    HttpStatus { operation: String, status: u16 },

    #[error("Temporary failure: {details}")]
    TemporaryFailure { details: String },

    // Authentication
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    // Configuration Errors
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Resource Management
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    // Operational Errors
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type BacktideResult<T> = std::result::Result<T, BacktideError>;
