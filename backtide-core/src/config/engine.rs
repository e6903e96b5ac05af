//! Backup engine configuration

use super::defaults::*;
use super::{parse_duration_from_env, parse_duration_secs_from_env};
use crate::error::{BacktideError, BacktideResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the change log, the backup procedure and scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the object store, change log and settings databases
    pub data_dir: PathBuf,

    /// Change-log entries handed to the backend per batch
    pub batch_size: usize,

    /// Objects read per page while seeding a first backup
    pub seed_chunk_size: usize,

    /// Delay between the end of one automatic backup and the next
    #[serde(with = "humantime_serde")]
    pub automatic_interval: Duration,

    /// Delay before a run starts draining
    #[serde(with = "humantime_serde")]
    pub run_start_delay: Duration,

    /// Pause after a cancel has cleared the change log
    #[serde(with = "humantime_serde")]
    pub cancel_settle_delay: Duration,

    /// Time since the last finished backup before problems are surfaced
    #[serde(with = "humantime_serde")]
    pub problem_threshold: Duration,

    /// Minimum time between two problem notifications
    #[serde(with = "humantime_serde")]
    pub notification_cooldown: Duration,

    /// Address the control API listens on
    pub control_bind_address: String,

    /// Backend used until a location has been chosen
    pub default_backend: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            seed_chunk_size: DEFAULT_SEED_CHUNK_SIZE,
            automatic_interval: Duration::from_secs(DEFAULT_AUTOMATIC_INTERVAL_SECS),
            run_start_delay: Duration::from_millis(DEFAULT_RUN_START_DELAY_MS),
            cancel_settle_delay: Duration::from_millis(DEFAULT_CANCEL_SETTLE_DELAY_MS),
            problem_threshold: Duration::from_secs(DEFAULT_PROBLEM_THRESHOLD_SECS),
            notification_cooldown: Duration::from_secs(DEFAULT_NOTIF_COOLDOWN_SECS),
            control_bind_address: DEFAULT_CONTROL_BIND_ADDRESS.to_string(),
            default_backend: DEFAULT_BACKEND_LOCATION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Overlay `BACKTIDE_*` environment variables
    pub fn apply_env(&mut self) -> BacktideResult<()> {
        if let Ok(dir) = std::env::var("BACKTIDE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(val) = std::env::var("BACKTIDE_BATCH_SIZE") {
            self.batch_size = val
                .parse()
                .map_err(|_| BacktideError::configuration("engine", "Invalid BACKTIDE_BATCH_SIZE"))?;
        }

        if let Ok(val) = std::env::var("BACKTIDE_SEED_CHUNK_SIZE") {
            self.seed_chunk_size = val.parse().map_err(|_| {
                BacktideError::configuration("engine", "Invalid BACKTIDE_SEED_CHUNK_SIZE")
            })?;
        }

        self.automatic_interval =
            parse_duration_secs_from_env("BACKTIDE_AUTOMATIC_INTERVAL_SECS", self.automatic_interval);
        self.cancel_settle_delay =
            parse_duration_from_env("BACKTIDE_CANCEL_SETTLE_DELAY_MS", self.cancel_settle_delay);

        if let Ok(addr) = std::env::var("BACKTIDE_CONTROL_BIND_ADDRESS") {
            self.control_bind_address = addr;
        }

        if let Ok(backend) = std::env::var("BACKTIDE_DEFAULT_BACKEND") {
            self.default_backend = backend;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> BacktideResult<()> {
        if self.batch_size == 0 {
            return Err(BacktideError::configuration(
                "engine.batch_size",
                "must be at least 1",
            ));
        }

        if self.batch_size > MAX_BATCH_SIZE {
            return Err(BacktideError::configuration(
                "engine.batch_size",
                format!("too large (max {})", MAX_BATCH_SIZE),
            ));
        }

        if self.seed_chunk_size == 0 {
            return Err(BacktideError::configuration(
                "engine.seed_chunk_size",
                "must be at least 1",
            ));
        }

        if self.automatic_interval.is_zero() {
            return Err(BacktideError::configuration(
                "engine.automatic_interval",
                "must be non-zero",
            ));
        }

        Ok(())
    }

    pub fn object_store_path(&self) -> PathBuf {
        self.data_dir.join("objects.redb")
    }

    pub fn change_log_path(&self) -> PathBuf {
        self.data_dir.join("change_log.redb")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.redb")
    }
}
