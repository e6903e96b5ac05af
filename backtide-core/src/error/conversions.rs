//! Error conversion implementations for BacktideError
//!
//! This module provides From trait implementations for converting
//! external error types into BacktideError variants.

use super::types::BacktideError;

// Storage error conversions
impl From<redb::TransactionError> for BacktideError {
    fn from(err: redb::TransactionError) -> Self {
        BacktideError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for BacktideError {
    fn from(err: redb::TableError) -> Self {
        BacktideError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for BacktideError {
    fn from(err: redb::StorageError) -> Self {
        BacktideError::Storage {
            operation: "storage_operation".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::DatabaseError> for BacktideError {
    fn from(err: redb::DatabaseError) -> Self {
        BacktideError::DatabaseError {
            operation: "database_operation".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::CommitError> for BacktideError {
    fn from(err: redb::CommitError) -> Self {
        BacktideError::Storage {
            operation: "commit".to_string(),
            source: Box::new(err),
        }
    }
}

// Serialization error conversions
impl From<serde_json::Error> for BacktideError {
    fn from(err: serde_json::Error) -> Self {
        BacktideError::JsonError(Box::new(err))
    }
}

impl From<toml::de::Error> for BacktideError {
    fn from(err: toml::de::Error) -> Self {
        BacktideError::ConfigurationError {
            component: "config_file".to_string(),
            message: err.to_string(),
        }
    }
}

// System error conversions
impl From<std::io::Error> for BacktideError {
    fn from(err: std::io::Error) -> Self {
        BacktideError::IoError(Box::new(err))
    }
}

impl From<url::ParseError> for BacktideError {
    fn from(err: url::ParseError) -> Self {
        BacktideError::ConfigurationError {
            component: "url".to_string(),
            message: format!("Invalid URL: {}", err),
        }
    }
}

// Network error conversions
impl From<reqwest::Error> for BacktideError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BacktideError::TemporaryFailure {
                details: format!("request timed out: {}", err),
            }
        } else if let Some(status) = err.status() {
            BacktideError::http_status("http_request", status.as_u16())
        } else {
            BacktideError::NetworkError(err.to_string())
        }
    }
}

// Async/Task error conversions
impl From<tokio::task::JoinError> for BacktideError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BacktideError::Internal {
                message: "Task was cancelled".to_string(),
            }
        } else if err.is_panic() {
            BacktideError::Internal {
                message: "Task panicked".to_string(),
            }
        } else {
            BacktideError::Internal {
                message: format!("Task failed: {}", err),
            }
        }
    }
}
