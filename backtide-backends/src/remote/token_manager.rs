//! OAuth token lifecycle for the remote object store
//!
//! Tokens are loaded from settings once, on first use. Every mutation goes
//! through [`TokenManager::handle_new_tokens`], which persists before the
//! in-memory copy changes.

use backtide_core::abstractions::Clock;
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::storage::SettingsStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

pub const ACCESS_TOKEN: &str = "backup.remote.access-token";
pub const REFRESH_TOKEN: &str = "backup.remote.refresh-token";
pub const TOKEN_EXPIRY: &str = "backup.remote.token-expiry";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tokens handed over by a login redirect or a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokens {
    pub access_token: String,
    /// Only set when the auth service rotated it
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct TokenManager {
    settings: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    refresh_url: String,
    expiry_margin: Duration,
    tokens: OnceCell<RwLock<StoredTokens>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
        cloud_origin: &str,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            settings,
            clock,
            http,
            refresh_url: format!("{}/auth/google/refresh", cloud_origin.trim_end_matches('/')),
            expiry_margin,
            tokens: OnceCell::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn state(&self) -> BacktideResult<&RwLock<StoredTokens>> {
        self.tokens
            .get_or_try_init(|| async {
                let tokens = self.load().await?;
                debug!(
                    "Loaded remote tokens (access: {}, refresh: {})",
                    tokens.access_token.is_some(),
                    tokens.refresh_token.is_some()
                );
                Ok::<_, BacktideError>(RwLock::new(tokens))
            })
            .await
    }

    async fn load(&self) -> BacktideResult<StoredTokens> {
        let as_string = |value: Option<Value>| match value {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };
        let expires_at = match self.settings.get(TOKEN_EXPIRY).await? {
            Some(value) => serde_json::from_value(value).ok(),
            None => None,
        };
        Ok(StoredTokens {
            access_token: as_string(self.settings.get(ACCESS_TOKEN).await?),
            refresh_token: as_string(self.settings.get(REFRESH_TOKEN).await?),
            expires_at,
        })
    }

    /// Current access token, expired or not
    pub async fn get_access_token(&self) -> BacktideResult<Option<String>> {
        Ok(self.state().await?.read().await.access_token.clone())
    }

    pub async fn has_refresh_token(&self) -> BacktideResult<bool> {
        Ok(self.state().await?.read().await.refresh_token.is_some())
    }

    pub async fn tokens(&self) -> BacktideResult<StoredTokens> {
        Ok(self.state().await?.read().await.clone())
    }

    /// `now >= expiry - margin`; a missing expiry counts as expired
    pub async fn is_access_token_expired(&self, margin: Duration) -> BacktideResult<bool> {
        let expires_at = self.state().await?.read().await.expires_at;
        let Some(expires_at) = expires_at else {
            return Ok(true);
        };
        let margin = chrono::Duration::from_std(margin)
            .map_err(|e| BacktideError::internal(format!("invalid token margin: {}", e)))?;
        Ok(self.clock.now() >= expires_at - margin)
    }

    /// Exchange the refresh token for a new access token when the current
    /// one is within the expiry margin, or unconditionally with `force`.
    pub async fn refresh_access_token(&self, force: bool) -> BacktideResult<()> {
        if !force && !self.is_access_token_expired(self.expiry_margin).await? {
            return Ok(());
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if !force && !self.is_access_token_expired(self.expiry_margin).await? {
            return Ok(());
        }

        let refresh_token = self
            .state()
            .await?
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or_else(|| BacktideError::authentication("No refresh token stored, log in first"))?;

        debug!("Refreshing remote access token");
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Token refresh failed with status {}", status);
            return Err(BacktideError::authentication(format!(
                "Token refresh failed with status {}",
                status
            )));
        }

        let refreshed: RefreshResponse = response.json().await?;
        self.handle_new_tokens(NewTokens {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            expires_in: Duration::from_secs(refreshed.expires_in),
        })
        .await
    }

    /// Persist and adopt a new token set
    pub async fn handle_new_tokens(&self, tokens: NewTokens) -> BacktideResult<()> {
        let state = self.state().await?;
        let expires_in = chrono::Duration::from_std(tokens.expires_in)
            .map_err(|e| BacktideError::validation_error("expires_in", &e.to_string()))?;
        let expires_at = self.clock.now() + expires_in;

        self.settings
            .set(ACCESS_TOKEN, Value::String(tokens.access_token.clone()))
            .await?;
        self.settings
            .set(TOKEN_EXPIRY, serde_json::to_value(expires_at)?)
            .await?;
        if let Some(refresh_token) = &tokens.refresh_token {
            self.settings
                .set(REFRESH_TOKEN, Value::String(refresh_token.clone()))
                .await?;
        }

        let mut current = state.write().await;
        current.access_token = Some(tokens.access_token);
        current.expires_at = Some(expires_at);
        if tokens.refresh_token.is_some() {
            current.refresh_token = tokens.refresh_token;
        }
        info!("Stored new remote tokens, valid until {}", expires_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backtide_core::abstractions::MockClock;
    use backtide_core::storage::MemorySettingsStore;
    use chrono::TimeZone;

    const MARGIN: Duration = Duration::from_secs(30 * 60);

    fn manager(settings: Arc<MemorySettingsStore>, clock: Arc<MockClock>) -> TokenManager {
        TokenManager::new(
            settings,
            clock,
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            MARGIN,
        )
    }

    #[tokio::test]
    async fn test_missing_expiry_counts_as_expired() {
        let manager = manager(Arc::new(MemorySettingsStore::new()), Arc::new(MockClock::new()));
        assert!(manager.is_access_token_expired(MARGIN).await.unwrap());
        assert_eq!(manager.get_access_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_margin_boundary() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(MockClock::with_time(start));
        let manager = manager(Arc::new(MemorySettingsStore::new()), clock.clone());

        manager
            .handle_new_tokens(NewTokens {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in: Duration::from_secs(3600),
            })
            .await
            .unwrap();
        let expiry = start + chrono::Duration::hours(1);

        clock.set(expiry - chrono::Duration::minutes(30) - chrono::Duration::seconds(1));
        assert!(!manager.is_access_token_expired(MARGIN).await.unwrap());

        clock.set(expiry - chrono::Duration::minutes(30));
        assert!(manager.is_access_token_expired(MARGIN).await.unwrap());
    }

    #[tokio::test]
    async fn test_tokens_persist_and_reload() {
        let settings = Arc::new(MemorySettingsStore::new());
        let clock = Arc::new(MockClock::with_time(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let first = manager(settings.clone(), clock.clone());
        first
            .handle_new_tokens(NewTokens {
                access_token: "a1".to_string(),
                refresh_token: Some("r1".to_string()),
                expires_in: Duration::from_secs(3600),
            })
            .await
            .unwrap();
        first
            .handle_new_tokens(NewTokens {
                access_token: "a2".to_string(),
                refresh_token: None,
                expires_in: Duration::from_secs(3600),
            })
            .await
            .unwrap();

        let reloaded = manager(settings, clock).tokens().await.unwrap();
        assert_eq!(reloaded.access_token.as_deref(), Some("a2"));
        assert_eq!(reloaded.refresh_token.as_deref(), Some("r1"));
        assert!(reloaded.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails() {
        let manager = manager(Arc::new(MemorySettingsStore::new()), Arc::new(MockClock::new()));
        let err = manager.refresh_access_token(true).await.unwrap_err();
        assert!(matches!(err, BacktideError::Authentication { .. }));
    }
}
