//! Constructor methods and convenience functions for BacktideError

use super::types::BacktideError;

impl BacktideError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use backtide_core::error::BacktideError;
    ///
    /// let err = BacktideError::configuration("engine.batch_size", "must be at least 1");
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        BacktideError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an error for a non-success HTTP status.
    ///
    /// 5xx statuses become `TemporaryFailure` so the retry layer picks them up.
    pub fn http_status(operation: impl Into<String>, status: u16) -> Self {
        let operation = operation.into();
        if (500..600).contains(&status) {
            BacktideError::TemporaryFailure {
                details: format!("{} returned HTTP {}", operation, status),
            }
        } else {
            BacktideError::HttpStatus { operation, status }
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        BacktideError::Authentication {
            message: message.into(),
        }
    }

    /// Create a timeout error with operation and duration
    pub fn timeout_error(operation: &str, duration: std::time::Duration) -> Self {
        BacktideError::Timeout {
            operation: operation.to_string(),
            duration,
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        BacktideError::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        BacktideError::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation_error(field: &str, message: &str) -> Self {
        BacktideError::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        BacktideError::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BacktideError::NetworkError(_)
                | BacktideError::TemporaryFailure { .. }
                | BacktideError::Timeout { .. }
        )
    }
}
