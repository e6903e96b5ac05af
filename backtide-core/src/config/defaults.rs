//! Default configuration values for Backtide
//!
//! This module centralizes all default values to make them easy to find and modify.

// Engine defaults
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_SEED_CHUNK_SIZE: usize = 500;
pub const DEFAULT_AUTOMATIC_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_RUN_START_DELAY_MS: u64 = 200;
pub const DEFAULT_CANCEL_SETTLE_DELAY_MS: u64 = 1000;
pub const DEFAULT_PROBLEM_THRESHOLD_SECS: u64 = 24 * 60 * 60; // 1 day
pub const DEFAULT_NOTIF_COOLDOWN_SECS: u64 = 7 * 24 * 60 * 60; // 1 week
pub const DEFAULT_CONTROL_BIND_ADDRESS: &str = "127.0.0.1:7710";
pub const DEFAULT_BACKEND_LOCATION: &str = "google-drive";

// Remote object store defaults
pub const DEFAULT_REMOTE_API_ORIGIN: &str = "https://www.googleapis.com";
pub const DEFAULT_CLOUD_ORIGIN: &str = "https://memex.cloud";
pub const DEFAULT_AUTH_SCOPE: &str = "https://www.googleapis.com/auth/drive.appdata";
pub const DEFAULT_REMOTE_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TOKEN_EXPIRY_MARGIN_SECS: u64 = 30 * 60;
pub const DEFAULT_APP_DATA_FOLDER: &str = "appDataFolder";

// Local network appliance defaults
pub const DEFAULT_APPLIANCE_BASE_URL: &str = "http://localhost:11922";
pub const DEFAULT_APPLIANCE_REQUEST_TIMEOUT_SECS: u64 = 30;

// Upper bounds accepted by validation
pub const MAX_BATCH_SIZE: usize = 10_000;
