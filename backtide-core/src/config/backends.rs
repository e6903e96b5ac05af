//! Backend adapter configuration

use super::defaults::*;
use super::{parse_duration_from_env, parse_duration_secs_from_env};
use crate::error::{BacktideError, BacktideResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote object store (Drive-shaped API) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Origin of the storage API, e.g. `https://www.googleapis.com`
    pub api_origin: String,

    /// Origin of the auth service that issues and refreshes tokens
    pub cloud_origin: String,

    /// OAuth scope requested at login
    pub auth_scope: String,

    /// Parent folder id every backup folder is created under
    pub root_folder: String,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Wait between attempts of a request that failed with a 5xx
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Total waiting budget before a retried request fails for good
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,

    /// Tokens expiring within this margin are refreshed before use
    #[serde(with = "humantime_serde")]
    pub token_expiry_margin: Duration,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            api_origin: DEFAULT_REMOTE_API_ORIGIN.to_string(),
            cloud_origin: DEFAULT_CLOUD_ORIGIN.to_string(),
            auth_scope: DEFAULT_AUTH_SCOPE.to_string(),
            root_folder: DEFAULT_APP_DATA_FOLDER.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REMOTE_REQUEST_TIMEOUT_SECS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            retry_timeout: Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS),
            token_expiry_margin: Duration::from_secs(DEFAULT_TOKEN_EXPIRY_MARGIN_SECS),
        }
    }
}

impl RemoteStoreConfig {
    /// Overlay `BACKTIDE_REMOTE_*` environment variables
    pub fn apply_env(&mut self) -> BacktideResult<()> {
        if let Ok(origin) = std::env::var("BACKTIDE_REMOTE_API_ORIGIN") {
            self.api_origin = origin;
        }
        if let Ok(origin) = std::env::var("BACKTIDE_CLOUD_ORIGIN") {
            self.cloud_origin = origin;
        }
        if let Ok(scope) = std::env::var("BACKTIDE_REMOTE_AUTH_SCOPE") {
            self.auth_scope = scope;
        }

        self.request_timeout =
            parse_duration_secs_from_env("BACKTIDE_REMOTE_REQUEST_TIMEOUT_SECS", self.request_timeout);
        self.retry_interval =
            parse_duration_from_env("BACKTIDE_REMOTE_RETRY_INTERVAL_MS", self.retry_interval);
        self.retry_timeout =
            parse_duration_secs_from_env("BACKTIDE_REMOTE_RETRY_TIMEOUT_SECS", self.retry_timeout);
        self.token_expiry_margin = parse_duration_secs_from_env(
            "BACKTIDE_TOKEN_EXPIRY_MARGIN_SECS",
            self.token_expiry_margin,
        );

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> BacktideResult<()> {
        for (field, origin) in [
            ("remote.api_origin", &self.api_origin),
            ("remote.cloud_origin", &self.cloud_origin),
        ] {
            url::Url::parse(origin)
                .map_err(|e| BacktideError::configuration(field, e.to_string()))?;
        }

        if self.retry_interval.is_zero() {
            return Err(BacktideError::configuration(
                "remote.retry_interval",
                "must be non-zero",
            ));
        }

        if self.retry_timeout < self.retry_interval {
            return Err(BacktideError::configuration(
                "remote.retry_timeout",
                "must be at least one retry interval",
            ));
        }

        Ok(())
    }
}

/// Local network appliance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceConfig {
    /// Base URL used when no URL has been stored in settings
    pub default_base_url: String,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            default_base_url: DEFAULT_APPLIANCE_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_APPLIANCE_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ApplianceConfig {
    pub fn apply_env(&mut self) -> BacktideResult<()> {
        if let Ok(url) = std::env::var("BACKTIDE_APPLIANCE_URL") {
            self.default_base_url = url;
        }
        self.request_timeout = parse_duration_secs_from_env(
            "BACKTIDE_APPLIANCE_REQUEST_TIMEOUT_SECS",
            self.request_timeout,
        );
        Ok(())
    }

    pub fn validate(&self) -> BacktideResult<()> {
        url::Url::parse(&self.default_base_url)
            .map_err(|e| BacktideError::configuration("appliance.default_base_url", e.to_string()))?;
        Ok(())
    }
}
