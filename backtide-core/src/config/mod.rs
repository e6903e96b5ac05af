//! Configuration module for Backtide
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! `BACKTIDE_*` environment variables, then validation.

use crate::error::BacktideResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod backends;
pub mod defaults;
pub mod engine;

pub use backends::{ApplianceConfig, RemoteStoreConfig};
pub use defaults::*;
pub use engine::EngineConfig;

/// Root configuration structure for Backtide
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktideConfig {
    /// Change log, procedure and scheduling
    pub engine: EngineConfig,

    /// Remote object store adapter
    pub remote: RemoteStoreConfig,

    /// Local network appliance adapter
    pub appliance: ApplianceConfig,
}

impl BacktideConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> BacktideResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file, then overlay the environment
    pub fn load(path: Option<&Path>) -> BacktideResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> BacktideResult<()> {
        self.engine.apply_env()?;
        self.remote.apply_env()?;
        self.appliance.apply_env()?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> BacktideResult<()> {
        self.engine.validate()?;
        self.remote.validate()?;
        self.appliance.validate()?;
        Ok(())
    }
}

/// Builder for test and embedding scenarios
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: BacktideConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.engine.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.engine.batch_size = size;
        self
    }

    pub fn remote_origins(mut self, api_origin: impl Into<String>, cloud_origin: impl Into<String>) -> Self {
        self.config.remote.api_origin = api_origin.into();
        self.config.remote.cloud_origin = cloud_origin.into();
        self
    }

    pub fn retry(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.remote.retry_interval = interval;
        self.config.remote.retry_timeout = timeout;
        self
    }

    pub fn build(self) -> BacktideResult<BacktideConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
