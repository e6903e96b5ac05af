//! Local network appliance backend
//!
//! A small HTTP server on the user's network. Every changed object is
//! PUT individually, then the batch's change-set and images documents are
//! stored under `/backup`. Requests carry the pairing sync key and the
//! target folder path as headers when they are configured.

use async_trait::async_trait;
use backtide_core::backend::{
    BackendContext, BackendFactory, BackupBackend, BackupBatch, BackupDocuments, BatchOutcome,
    CHANGE_SETS_COLLECTION, IMAGES_COLLECTION,
};
use backtide_core::config::ApplianceConfig;
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::storage::{BackupInfoStorage, SettingsStore};
use backtide_core::types::{NotificationId, ObjectChange};
use futures::stream::{self, StreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub const BACKEND_TYPE: &str = "local";

pub const APPLIANCE_URL: &str = "backup.appliance.url";
pub const APPLIANCE_SYNC_KEY: &str = "backup.appliance.sync-key";
pub const APPLIANCE_FOLDER_PATH: &str = "backup.appliance.folder-path";

pub const SYNC_KEY_HEADER: &str = "X-Sync-Key";
pub const FOLDER_PATH_HEADER: &str = "X-Folder-Path";

/// Object uploads in flight per batch
const UPLOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default)]
struct Connection {
    base_url: String,
    sync_key: Option<String>,
    folder_path: Option<String>,
}

impl Connection {
    fn url(&self, segments: &[&str]) -> BacktideResult<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                BacktideError::configuration(
                    APPLIANCE_URL,
                    format!("'{}' cannot be used as a base URL", self.base_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.sync_key {
            request = request.header(SYNC_KEY_HEADER, key);
        }
        if let Some(path) = &self.folder_path {
            request = request.header(FOLDER_PATH_HEADER, path);
        }
        request
    }
}

pub struct ApplianceBackend {
    http: reqwest::Client,
    info_storage: BackupInfoStorage,
    default_base_url: String,
}

impl ApplianceBackend {
    pub fn new(config: &ApplianceConfig, settings: Arc<dyn SettingsStore>) -> BacktideResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BacktideError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            info_storage: BackupInfoStorage::new(settings),
            default_base_url: config.default_base_url.clone(),
        })
    }

    /// Store where the appliance lives and how to pair with it
    pub async fn configure(
        settings: Arc<dyn SettingsStore>,
        base_url: &str,
        sync_key: Option<&str>,
        folder_path: Option<&str>,
    ) -> BacktideResult<()> {
        Url::parse(base_url)?;
        let info = BackupInfoStorage::new(settings);
        info.set_string(APPLIANCE_URL, base_url).await?;
        for (key, value) in [(APPLIANCE_SYNC_KEY, sync_key), (APPLIANCE_FOLDER_PATH, folder_path)] {
            match value {
                Some(value) => info.set_string(key, value).await?,
                None => info.remove(key).await?,
            }
        }
        info!("Configured backup appliance at {}", base_url);
        Ok(())
    }

    async fn connection(&self) -> BacktideResult<Connection> {
        Ok(Connection {
            base_url: self
                .info_storage
                .get_string(APPLIANCE_URL)
                .await?
                .unwrap_or_else(|| self.default_base_url.clone()),
            sync_key: self.info_storage.get_string(APPLIANCE_SYNC_KEY).await?,
            folder_path: self.info_storage.get_string(APPLIANCE_FOLDER_PATH).await?,
        })
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        connection: &Connection,
        operation: &str,
        segments: &[&str],
        body: &T,
    ) -> BacktideResult<()> {
        let url = connection.url(segments)?;
        let response = connection
            .with_headers(self.http.put(url))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BacktideError::http_status(operation, response.status().as_u16()));
        }
        Ok(())
    }

    /// PUT every object, returning the changes the appliance refused.
    ///
    /// A transport failure or server error on any object fails the whole
    /// batch, as does a batch the appliance refused entirely.
    async fn upload_objects(
        &self,
        connection: &Connection,
        changes: Vec<ObjectChange>,
    ) -> BacktideResult<Vec<ObjectChange>> {
        let total = changes.len();
        let results: Vec<(ObjectChange, BacktideResult<()>)> = stream::iter(changes)
            .map(move |change| async move {
                let key = object_key(&change.object_pk);
                let result = self
                    .put_json(connection, "store object", &[change.collection.as_str(), key.as_str()], &change)
                    .await;
                (change, result)
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .collect()
            .await;

        let mut rejected = Vec::new();
        let mut last_refusal = None;
        for (change, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if is_refusal(&e) => {
                    warn!(
                        "Appliance refused {}/{}: {}",
                        change.collection, change.object_pk, e
                    );
                    rejected.push(change);
                    last_refusal = Some(e);
                }
                Err(e) => {
                    warn!(
                        "Could not store {}/{} on the appliance: {}",
                        change.collection, change.object_pk, e
                    );
                    return Err(e);
                }
            }
        }

        match last_refusal {
            Some(e) if rejected.len() == total => Err(e),
            _ => Ok(rejected),
        }
    }
}

fn object_key(pk: &Value) -> String {
    match pk {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The appliance answered and declined this one object
fn is_refusal(error: &BacktideError) -> bool {
    matches!(error, BacktideError::HttpStatus { status, .. } if (400..500).contains(status))
}

#[async_trait]
impl BackupBackend for ApplianceBackend {
    fn backend_type(&self) -> &'static str {
        BACKEND_TYPE
    }

    async fn is_reachable(&self) -> bool {
        let connection = match self.connection().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Could not read appliance settings: {}", e);
                return false;
            }
        };
        let Ok(url) = connection.url(&["status"]) else {
            return false;
        };

        let request = connection
            .with_headers(self.http.post(url))
            .json(&json!({ "syncKey": connection.sync_key }));
        match request.send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Appliance not reachable: {}", e);
                false
            }
        }
    }

    /// Pairing is checked by the status call
    async fn is_authenticated(&self) -> bool {
        self.is_reachable().await
    }

    async fn backup_changes(&self, batch: BackupBatch) -> BacktideResult<BatchOutcome> {
        let connection = self.connection().await?;
        let rejected = self.upload_objects(&connection, batch.changes.clone()).await?;

        let accepted: Vec<ObjectChange> = batch
            .changes
            .iter()
            .filter(|change| !rejected.iter().any(|r| r.timestamp == change.timestamp))
            .cloned()
            .collect();
        if accepted.is_empty() {
            return Ok(BatchOutcome { rejected });
        }

        let documents = BackupDocuments::prepare(&BackupBatch {
            changes: accepted,
            schema_version: batch.schema_version,
            store_blobs: batch.store_blobs,
        });
        self.put_json(
            &connection,
            "store change set",
            &["backup", CHANGE_SETS_COLLECTION, documents.name.as_str()],
            &documents.change_set,
        )
        .await?;
        if let Some(images) = &documents.images {
            self.put_json(
                &connection,
                "store images",
                &["backup", IMAGES_COLLECTION, documents.name.as_str()],
                images,
            )
            .await?;
        }

        debug!(
            "Stored change set {} on the appliance ({} rejected)",
            documents.name,
            rejected.len()
        );
        Ok(BatchOutcome { rejected })
    }

    async fn list_objects(&self, collection: &str) -> BacktideResult<Vec<String>> {
        let connection = self.connection().await?;
        let url = connection.url(&["backup", collection])?;
        let response = connection.with_headers(self.http.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(Vec::new()),
            status if !status.is_success() => {
                return Err(BacktideError::http_status("list objects", status.as_u16()));
            }
            _ => {}
        }

        let body = response.text().await?;
        Ok(body
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect())
    }

    async fn retrieve_object(&self, collection: &str, name: &str) -> BacktideResult<Value> {
        let connection = self.connection().await?;
        let url = connection.url(&["backup", collection, name])?;
        let response = connection.with_headers(self.http.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BacktideError::not_found(format!("{}/{}", collection, name))),
            status if !status.is_success() => {
                Err(BacktideError::http_status("retrieve object", status.as_u16()))
            }
            _ => Ok(response.json().await?),
        }
    }

    fn login_url(&self) -> Option<String> {
        None
    }

    async fn handle_login_redirected_back(&self, _location: &str) -> BacktideResult<()> {
        Ok(())
    }

    async fn notification_for_failure(&self) -> NotificationId {
        NotificationId::BackupError
    }
}

/// Factory for creating local appliance backends
pub struct ApplianceBackendFactory;

impl BackendFactory for ApplianceBackendFactory {
    fn create_backend(&self, context: &BackendContext) -> BacktideResult<Arc<dyn BackupBackend>> {
        let backend = ApplianceBackend::new(&context.config.appliance, context.settings.clone())?;
        Ok(Arc::new(backend))
    }

    fn backend_type(&self) -> &'static str {
        BACKEND_TYPE
    }

    fn description(&self) -> &'static str {
        "Backup appliance on the local network"
    }
}
