//! Time abstractions for testability
//!
//! Everything in the engine that reads the wall clock (change-log
//! timestamps, token expiry, notification cooldowns) goes through [`Clock`]
//! so tests can pin and advance time deterministically.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstraction for time operations
#[async_trait]
pub trait Clock: Send + Sync {
    /// Microseconds since the Unix epoch
    fn now_micros(&self) -> u64;

    /// Sleep for a duration
    async fn sleep(&self, duration: Duration);

    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc> {
        micros_to_datetime(self.now_micros())
    }
}

/// Convert microseconds since the epoch into a UTC timestamp
pub fn micros_to_datetime(micros: u64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Production clock using system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create new instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Mock clock for deterministic testing
///
/// Time only moves through [`MockClock::advance`], [`MockClock::set`] or
/// [`Clock::sleep`], which advances the clock by the requested duration
/// and yields instead of waiting.
#[derive(Debug, Default)]
pub struct MockClock {
    current_micros: AtomicU64,
}

impl MockClock {
    /// Create new mock clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a specific starting time
    pub fn with_time(time: DateTime<Utc>) -> Self {
        Self {
            current_micros: AtomicU64::new(time.timestamp_micros().max(0) as u64),
        }
    }

    /// Advance time by duration
    pub fn advance(&self, duration: Duration) {
        self.current_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, time: DateTime<Utc>) {
        self.current_micros
            .store(time.timestamp_micros().max(0) as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now_micros(&self) -> u64 {
        self.current_micros.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
