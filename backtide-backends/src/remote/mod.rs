//! Remote object store backend
//!
//! Change-set and image documents are written as JSON files into one
//! folder per collection under the application data root. Access is
//! OAuth-guarded; tokens come from a browser login redirect and are
//! refreshed through the cloud auth service.

use async_trait::async_trait;
use backtide_core::abstractions::Clock;
use backtide_core::backend::{
    BackendContext, BackendFactory, BackupBackend, BackupBatch, BackupDocuments, BatchOutcome,
    CHANGE_SETS_COLLECTION, IMAGES_COLLECTION,
};
use backtide_core::config::RemoteStoreConfig;
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::storage::{BackupInfoStorage, SettingsStore};
use backtide_core::types::NotificationId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub mod client;
pub mod token_manager;

pub use client::{DriveClient, StorageQuota};
pub use token_manager::{NewTokens, StoredTokens, TokenManager};

pub const BACKEND_TYPE: &str = "google-drive";

pub struct RemoteStoreBackend {
    config: RemoteStoreConfig,
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    client: DriveClient,
}

impl RemoteStoreBackend {
    pub fn new(
        config: RemoteStoreConfig,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> BacktideResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BacktideError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let tokens = Arc::new(TokenManager::new(
            settings.clone(),
            clock,
            http.clone(),
            &config.cloud_origin,
            config.token_expiry_margin,
        ));
        let client = DriveClient::new(&config, http.clone(), tokens.clone(), BackupInfoStorage::new(settings));

        Ok(Self {
            config,
            http,
            tokens,
            client,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn client(&self) -> &DriveClient {
        &self.client
    }
}

/// Pull the token fields out of a login redirect URL. Relative URLs, as
/// seen by the control API's callback route, are accepted too.
pub fn parse_login_redirect(location: &str) -> BacktideResult<NewTokens> {
    let url = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost/")?.join(location)?,
        Err(e) => return Err(e.into()),
    };

    let mut access_token = None;
    let mut refresh_token = None;
    let mut expires_in = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "access_token" => access_token = Some(value.into_owned()),
            "refresh_token" => refresh_token = Some(value.into_owned()),
            "expires_in" => {
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| BacktideError::validation_error("expires_in", "not a number of seconds"))?;
                expires_in = Some(Duration::from_secs(secs));
            }
            _ => {}
        }
    }

    let access_token = access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BacktideError::authentication("Login redirect carried no access token"))?;
    Ok(NewTokens {
        access_token,
        refresh_token: refresh_token.filter(|t| !t.is_empty()),
        expires_in: expires_in
            .ok_or_else(|| BacktideError::validation_error("expires_in", "missing from login redirect"))?,
    })
}

#[async_trait]
impl BackupBackend for RemoteStoreBackend {
    fn backend_type(&self) -> &'static str {
        BACKEND_TYPE
    }

    async fn is_reachable(&self) -> bool {
        match self.http.get(&self.config.api_origin).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Remote store not reachable: {}", e);
                false
            }
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.tokens.has_refresh_token().await.unwrap_or(false)
    }

    async fn backup_changes(&self, batch: BackupBatch) -> BacktideResult<BatchOutcome> {
        let documents = BackupDocuments::prepare(&batch);
        self.client
            .store_object(CHANGE_SETS_COLLECTION, &documents.name, &documents.change_set)
            .await?;
        if let Some(images) = &documents.images {
            self.client
                .store_object(IMAGES_COLLECTION, &documents.name, images)
                .await?;
        }
        debug!(
            "Uploaded change set {} with {} changes",
            documents.name,
            documents.change_set.changes.len()
        );
        Ok(BatchOutcome::all_accepted())
    }

    async fn list_objects(&self, collection: &str) -> BacktideResult<Vec<String>> {
        self.client.list_folder(collection).await
    }

    async fn retrieve_object(&self, collection: &str, name: &str) -> BacktideResult<Value> {
        self.client.get_object(collection, name).await
    }

    fn login_url(&self) -> Option<String> {
        let mut url = Url::parse(&format!(
            "{}/auth/google",
            self.config.cloud_origin.trim_end_matches('/')
        ))
        .ok()?;
        url.query_pairs_mut().append_pair("scope", &self.config.auth_scope);
        Some(url.to_string())
    }

    async fn handle_login_redirected_back(&self, location: &str) -> BacktideResult<()> {
        let tokens = parse_login_redirect(location)?;
        self.tokens.handle_new_tokens(tokens).await?;
        info!("Logged in to the remote store");
        Ok(())
    }

    async fn notification_for_failure(&self) -> NotificationId {
        match self.client.storage_quota().await {
            Ok(quota) if quota.is_exhausted() => NotificationId::DriveSizeEmpty,
            Ok(_) => NotificationId::BackupError,
            Err(e) => {
                warn!("Could not read remote storage quota: {}", e);
                NotificationId::BackupError
            }
        }
    }
}

/// Factory for creating remote object store backends
pub struct RemoteStoreBackendFactory;

impl BackendFactory for RemoteStoreBackendFactory {
    fn create_backend(&self, context: &BackendContext) -> BacktideResult<Arc<dyn BackupBackend>> {
        let backend = RemoteStoreBackend::new(
            context.config.remote.clone(),
            context.settings.clone(),
            context.clock.clone(),
        )?;
        Ok(Arc::new(backend))
    }

    fn backend_type(&self) -> &'static str {
        BACKEND_TYPE
    }

    fn description(&self) -> &'static str {
        "Google Drive application data folder"
    }
}
