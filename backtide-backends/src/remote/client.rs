//! HTTP client for a Drive-shaped folder/file API

use super::token_manager::TokenManager;
use backtide_core::config::RemoteStoreConfig;
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::patterns::{retry, RetryConfig};
use backtide_core::storage::BackupInfoStorage;
use backtide_core::types::{BackupStatus, NotificationId};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuota {
    /// Absent for unlimited accounts
    pub limit: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
}

impl StorageQuota {
    pub fn is_exhausted(&self) -> bool {
        let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<u64>().ok());
        match (parse(&self.limit), parse(&self.usage)) {
            (Some(limit), Some(usage)) => usage >= limit,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    storage_quota: StorageQuota,
}

#[derive(Debug, Serialize)]
struct FileMetadata<'a> {
    name: &'a str,
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<&'a str>>,
}

struct RequestBody {
    content_type: &'static str,
    bytes: Vec<u8>,
}

/// Folder and file operations with a parent → {name → id} cache
pub struct DriveClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    info_storage: BackupInfoStorage,
    api_base: String,
    upload_base: String,
    root_folder: String,
    retry_interval: Duration,
    retry_timeout: Duration,
    id_cache: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl DriveClient {
    pub fn new(
        config: &RemoteStoreConfig,
        http: reqwest::Client,
        tokens: Arc<TokenManager>,
        info_storage: BackupInfoStorage,
    ) -> Self {
        let origin = config.api_origin.trim_end_matches('/');
        Self {
            http,
            tokens,
            info_storage,
            api_base: format!("{}/drive/v3", origin),
            upload_base: format!("{}/upload/drive/v3", origin),
            root_folder: config.root_folder.clone(),
            retry_interval: config.retry_interval,
            retry_timeout: config.retry_timeout,
            id_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_folder(&self) -> &str {
        &self.root_folder
    }

    /// Create or overwrite `file_name` inside the folder `folder_name`
    pub async fn store_object<T: Serialize + ?Sized>(
        &self,
        folder_name: &str,
        file_name: &str,
        object: &T,
    ) -> BacktideResult<()> {
        let root = self.root_folder.clone();
        let folder_id = self.create_folder(&root, folder_name).await?;
        let file_id = self.child_id(&folder_id, file_name).await?;

        let metadata = FileMetadata {
            name: file_name,
            mime_type: "application/json",
            parents: file_id.is_none().then(|| vec![folder_id.as_str()]),
        };
        let (method, url) = match &file_id {
            Some(id) => (
                Method::PATCH,
                format!("{}/files/{}?uploadType=resumable", self.upload_base, id),
            ),
            None => (
                Method::POST,
                format!("{}/files?uploadType=resumable", self.upload_base),
            ),
        };

        let session = self
            .send(
                "start upload",
                method,
                url,
                Some(RequestBody {
                    content_type: "application/json; charset=UTF-8",
                    bytes: serde_json::to_vec(&metadata)?,
                }),
            )
            .await?;
        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BacktideError::NetworkError("Upload session without Location header".to_string()))?;

        let uploaded = self
            .send(
                "upload content",
                Method::PUT,
                location,
                Some(RequestBody {
                    content_type: "application/json",
                    bytes: serde_json::to_vec(object)?,
                }),
            )
            .await?;

        if file_id.is_none() {
            match uploaded.json::<FileEntry>().await {
                Ok(entry) => {
                    self.id_cache
                        .lock()
                        .entry(folder_id.clone())
                        .or_default()
                        .insert(entry.name, entry.id);
                }
                Err(_) => {
                    // id unknown, re-list the folder next time
                    self.id_cache.lock().remove(&folder_id);
                }
            }
        }
        debug!("Stored {}/{}", folder_name, file_name);
        Ok(())
    }

    /// Names of the files in a folder under the root; empty if it does not exist
    pub async fn list_folder(&self, folder_name: &str) -> BacktideResult<Vec<String>> {
        let root = self.root_folder.clone();
        let Some(folder_id) = self.child_id(&root, folder_name).await? else {
            return Ok(Vec::new());
        };
        self.cache_folder_contents(&folder_id).await?;
        let mut names: Vec<String> = self
            .id_cache
            .lock()
            .get(&folder_id)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    pub async fn get_object(&self, folder_name: &str, file_name: &str) -> BacktideResult<Value> {
        let root = self.root_folder.clone();
        let folder_id = self
            .child_id(&root, folder_name)
            .await?
            .ok_or_else(|| BacktideError::not_found(format!("remote folder {}", folder_name)))?;
        let file_id = self
            .child_id(&folder_id, file_name)
            .await?
            .ok_or_else(|| BacktideError::not_found(format!("remote file {}/{}", folder_name, file_name)))?;

        let url = format!("{}/files/{}?alt=media", self.api_base, file_id);
        Ok(self.send("read file", Method::GET, url, None).await?.json().await?)
    }

    pub async fn storage_quota(&self) -> BacktideResult<StorageQuota> {
        let url = format!("{}/about?fields=storageQuota", self.api_base);
        let about: About = self.send("read quota", Method::GET, url, None).await?.json().await?;
        Ok(about.storage_quota)
    }

    /// Id of an existing or newly created folder
    pub async fn create_folder(&self, parent_id: &str, name: &str) -> BacktideResult<String> {
        if let Some(id) = self.child_id(parent_id, name).await? {
            return Ok(id);
        }

        let body = json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });
        let url = format!("{}/files", self.api_base);
        let created: FileEntry = self
            .send(
                "create folder",
                Method::POST,
                url,
                Some(RequestBody {
                    content_type: "application/json",
                    bytes: serde_json::to_vec(&body)?,
                }),
            )
            .await?
            .json()
            .await?;

        let mut cache = self.id_cache.lock();
        cache
            .entry(parent_id.to_string())
            .or_default()
            .insert(name.to_string(), created.id.clone());
        cache.insert(created.id.clone(), HashMap::new());
        debug!("Created remote folder {} ({})", name, created.id);
        Ok(created.id)
    }

    async fn child_id(&self, parent_id: &str, name: &str) -> BacktideResult<Option<String>> {
        let cached = self.id_cache.lock().contains_key(parent_id);
        if !cached {
            self.cache_folder_contents(parent_id).await?;
        }
        Ok(self
            .id_cache
            .lock()
            .get(parent_id)
            .and_then(|children| children.get(name).cloned()))
    }

    async fn cache_folder_contents(&self, parent_id: &str) -> BacktideResult<()> {
        let mut children = HashMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = Url::parse(&format!("{}/files", self.api_base))?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("q", &format!("'{}' in parents", parent_id));
                query.append_pair("spaces", &self.root_folder);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let page: FileList = self
                .send("list folder", Method::GET, url.to_string(), None)
                .await?
                .json()
                .await?;
            for entry in page.files {
                children.insert(entry.name, entry.id);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Cached {} entries of remote folder {}", children.len(), parent_id);
        self.id_cache.lock().insert(parent_id.to_string(), children);
        Ok(())
    }

    /// Authorized request, retrying 5xx responses at a fixed interval
    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: String,
        body: Option<RequestBody>,
    ) -> BacktideResult<Response> {
        self.tokens.refresh_access_token(false).await?;
        let token = self
            .tokens
            .get_access_token()
            .await?
            .ok_or_else(|| BacktideError::authentication("Not logged in to the remote store"))?;

        let http = self.http.clone();
        let body = body.map(Arc::new);
        let operation_name = operation.to_string();
        let config = RetryConfig::for_remote_requests(operation, self.retry_interval, self.retry_timeout);

        let result = retry(config, move || {
            let mut request = http.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = &body {
                request = request
                    .header(CONTENT_TYPE, body.content_type)
                    .body(body.bytes.clone());
            }
            let operation_name = operation_name.clone();
            Box::pin(async move {
                let response = request.send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    Err(BacktideError::http_status(operation_name, status.as_u16()))
                }
            })
        })
        .await;

        if let Err(e) = &result {
            error!("Request to the remote store failed: {}", e);
            self.record_failure().await;
        }
        result
    }

    async fn record_failure(&self) {
        let status = BackupStatus::failed(NotificationId::DriveSizeEmpty);
        if let Err(e) = self.info_storage.set_backup_status(&status).await {
            warn!("Failed to store backup status: {}", e);
        }
    }
}
