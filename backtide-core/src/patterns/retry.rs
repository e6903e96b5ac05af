//! Retry patterns for handling transient failures
//!
//! Remote requests are retried while the error is transient, waiting a fixed
//! interval between attempts, until either the attempt cap or the total
//! retry budget is exhausted.

use crate::error::{BacktideError, BacktideResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Wait between attempts
    pub interval: Duration,
    /// Maximum total time to spend waiting between attempts
    pub max_total_delay: Option<Duration>,
    /// Function to determine if an error is retryable
    pub is_retryable: fn(&BacktideError) -> bool,
    /// Per-operation identifier for log lines
    pub operation_name: Option<String>,
}

impl RetryConfig {
    /// Retry transient failures up to `attempts` times, `delay` apart
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            interval: delay,
            max_total_delay: None,
            is_retryable: BacktideError::is_transient,
            operation_name: None,
        }
    }

    /// Retry transient failures every `interval` until `timeout` worth of
    /// waiting has been spent.
    pub fn for_remote_requests(operation_name: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            interval,
            max_total_delay: Some(timeout),
            is_retryable: BacktideError::is_transient,
            operation_name: Some(operation_name.to_string()),
        }
    }
}

/// Retry an async operation with the given configuration
pub async fn retry<F, T>(config: RetryConfig, mut operation: F) -> BacktideResult<T>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = BacktideResult<T>> + Send>>,
{
    let mut attempt = 0;
    let mut total_delay = Duration::ZERO;
    let operation_name = config.operation_name.as_deref().unwrap_or("operation");

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if !(config.is_retryable)(&error) {
                    debug!("{}: error is not retryable: {}", operation_name, error);
                    return Err(error);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        "{}: max retry attempts ({}) reached",
                        operation_name, config.max_attempts
                    );
                    return Err(error);
                }

                let delay = config.interval;

                total_delay = total_delay.saturating_add(delay);
                if let Some(max_total) = config.max_total_delay {
                    if total_delay > max_total {
                        warn!(
                            "{}: giving up after {:?} of retries: {}",
                            operation_name, max_total, error
                        );
                        return Err(BacktideError::timeout_error(operation_name, max_total));
                    }
                }

                warn!(
                    "Retry attempt {} for {} after error: {} (waiting {:?})",
                    attempt, operation_name, error, delay
                );

                sleep(delay).await;
            }
        }
    }
}
