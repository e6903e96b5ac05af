// In-process HTTP servers standing in for the remote services
#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use backtide_core::abstractions::MockClock;
use backtide_core::backend::BackupBackend;
use backtide_core::procedure::{BackupProcedure, ProcedureConfig};
use backtide_core::storage::{
    BackupInfoStorage, ChangeLog, ChangeTracker, MemorySettingsStore, RedbObjectStore,
};
use backtide_core::types::{ChangeOperation, CollectionDefinition, ObjectChange};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Serve `router` on an ephemeral local port and return its base URL
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn change(timestamp: u64, collection: &str, pk: Value, object: Option<Value>) -> ObjectChange {
    ObjectChange {
        timestamp,
        collection: collection.to_string(),
        object_pk: pk,
        operation: if object.is_some() {
            ChangeOperation::Create
        } else {
            ChangeOperation::Delete
        },
        object,
        blobs: BTreeMap::new(),
    }
}

/// Local object store and change log feeding a backup procedure
pub struct Engine {
    pub store: Arc<RedbObjectStore>,
    pub change_log: Arc<ChangeLog>,
    pub info: BackupInfoStorage,
    pub clock: Arc<MockClock>,
    temp_dir: TempDir,
}

impl Engine {
    pub fn new(settings: Arc<MemorySettingsStore>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::with_time(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let version = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let collections = vec![
            CollectionDefinition::new("pages", "url", version).with_blob_fields(["screenshot"]),
            CollectionDefinition::new("tags", "id", version),
        ];

        let store = Arc::new(
            RedbObjectStore::open(temp_dir.path().join("objects.redb"), collections.clone()).unwrap(),
        );
        let change_log = Arc::new(
            ChangeLog::open(temp_dir.path().join("change_log.redb"), clock.clone()).unwrap(),
        );
        store.register_hook(Arc::new(ChangeTracker::new(change_log.clone(), &collections)));

        Self {
            store,
            change_log,
            info: BackupInfoStorage::new(settings),
            clock,
            temp_dir,
        }
    }

    pub fn procedure(&self, backend: Arc<dyn BackupBackend>, batch_size: usize) -> Arc<BackupProcedure> {
        Arc::new(BackupProcedure::new(
            self.store.clone(),
            self.change_log.clone(),
            self.info.clone(),
            backend,
            self.clock.clone(),
            ProcedureConfig {
                batch_size,
                seed_chunk_size: 10,
                run_start_delay: Duration::from_millis(100),
                cancel_settle_delay: Duration::from_millis(100),
            },
        ))
    }
}

// Drive-shaped object store

#[derive(Debug, Clone)]
pub struct DriveFile {
    pub name: String,
    pub parent: String,
    pub folder: bool,
    pub content: Option<Value>,
}

#[derive(Debug, Clone)]
struct UploadSession {
    file_id: Option<String>,
    name: String,
    parent: Option<String>,
}

#[derive(Default)]
pub struct DriveState {
    pub files: Mutex<HashMap<String, DriveFile>>,
    sessions: Mutex<HashMap<String, UploadSession>>,
    next_id: AtomicU32,
    /// Upcoming `about` requests answered with a 500
    pub about_failures: AtomicU32,
    pub about_calls: AtomicU32,
    /// Upcoming upload starts answered with a 500
    pub upload_failures: AtomicU32,
    pub upload_calls: AtomicU32,
    /// Upcoming content uploads answered with a 500
    pub content_failures: AtomicU32,
    pub content_calls: AtomicU32,
    pub quota: Mutex<(Option<String>, String)>,
    pub refresh_calls: AtomicU32,
    pub tokens_seen: Mutex<Vec<String>>,
    pub list_calls: AtomicU32,
}

impl DriveState {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Name → content of the files inside the folder called `folder`
    pub fn folder_contents(&self, folder: &str) -> BTreeMap<String, Value> {
        let files = self.files.lock();
        let Some((folder_id, _)) = files.iter().find(|(_, f)| f.folder && f.name == folder) else {
            return BTreeMap::new();
        };
        files
            .values()
            .filter(|f| &f.parent == folder_id)
            .filter_map(|f| f.content.clone().map(|c| (f.name.clone(), c)))
            .collect()
    }

    pub fn folder_names(&self, parent: &str) -> HashSet<String> {
        self.files
            .lock()
            .values()
            .filter(|f| f.folder && f.parent == parent)
            .map(|f| f.name.clone())
            .collect()
    }
}

type DriveShared = Arc<DriveState>;

/// Take one pending failure off `counter`
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn authorized(state: &DriveState, headers: &HeaderMap) -> bool {
    match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => {
            state.tokens_seen.lock().push(token.to_string());
            true
        }
        None => false,
    }
}

const PAGE_SIZE: usize = 2;

async fn list_files(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.list_calls.fetch_add(1, Ordering::SeqCst);

    let parent = query
        .get("q")
        .and_then(|q| q.split('\'').nth(1))
        .unwrap_or("appDataFolder")
        .to_string();
    let mut entries: Vec<(String, String)> = state
        .files
        .lock()
        .iter()
        .filter(|(_, f)| f.parent == parent)
        .map(|(id, f)| (id.clone(), f.name.clone()))
        .collect();
    entries.sort();

    let offset: usize = query.get("pageToken").and_then(|t| t.parse().ok()).unwrap_or(0);
    let page: Vec<Value> = entries
        .iter()
        .skip(offset)
        .take(PAGE_SIZE)
        .map(|(id, name)| json!({"id": id, "name": name}))
        .collect();
    let mut body = json!({ "files": page });
    if offset + PAGE_SIZE < entries.len() {
        body["nextPageToken"] = json!((offset + PAGE_SIZE).to_string());
    }
    Json(body).into_response()
}

async fn create_folder(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = state.next_id("folder");
    let name = body["name"].as_str().unwrap_or_default().to_string();
    state.files.lock().insert(
        id.clone(),
        DriveFile {
            name: name.clone(),
            parent: body["parents"][0].as_str().unwrap_or_default().to_string(),
            folder: body["mimeType"] == "application/vnd.google-apps.folder",
            content: None,
        },
    );
    Json(json!({"id": id, "name": name})).into_response()
}

async fn read_file(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.files.lock().get(&id).and_then(|f| f.content.clone()) {
        Some(content) => Json(content).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn about(State(state): State<DriveShared>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.about_calls.fetch_add(1, Ordering::SeqCst);
    if take_failure(&state.about_failures) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let (limit, usage) = state.quota.lock().clone();
    Json(json!({"storageQuota": {"limit": limit, "usage": usage}})).into_response()
}

fn session_response(state: &DriveState, headers: &HeaderMap, session: UploadSession) -> Response {
    state.upload_calls.fetch_add(1, Ordering::SeqCst);
    if take_failure(&state.upload_failures) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let session_id = state.next_id("session");
    state.sessions.lock().insert(session_id.clone(), session);
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    (
        [(header::LOCATION, format!("http://{}/upload-session/{}", host, session_id))],
        StatusCode::OK,
    )
        .into_response()
}

async fn start_create_upload(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Json(metadata): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let session = UploadSession {
        file_id: None,
        name: metadata["name"].as_str().unwrap_or_default().to_string(),
        parent: metadata["parents"][0].as_str().map(String::from),
    };
    session_response(&state, &headers, session)
}

async fn start_update_upload(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(metadata): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let session = UploadSession {
        file_id: Some(id),
        name: metadata["name"].as_str().unwrap_or_default().to_string(),
        parent: None,
    };
    session_response(&state, &headers, session)
}

async fn upload_content(
    State(state): State<DriveShared>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.content_calls.fetch_add(1, Ordering::SeqCst);
    if take_failure(&state.content_failures) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Some(session) = state.sessions.lock().remove(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(content) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut files = state.files.lock();
    let id = match session.file_id {
        Some(id) => {
            match files.get_mut(&id) {
                Some(file) => file.content = Some(content),
                None => return StatusCode::NOT_FOUND.into_response(),
            }
            id
        }
        None => {
            let id = state.next_id("file");
            files.insert(
                id.clone(),
                DriveFile {
                    name: session.name.clone(),
                    parent: session.parent.unwrap_or_default(),
                    folder: false,
                    content: Some(content),
                },
            );
            id
        }
    };
    Json(json!({"id": id, "name": session.name})).into_response()
}

async fn refresh_token(State(state): State<DriveShared>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if body["refresh_token"] != "refresh-1" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"access_token": "fresh-access", "expires_in": 3600})).into_response()
}

pub fn drive_router(state: DriveShared) -> Router {
    Router::new()
        .route("/drive/v3/files", get(list_files).post(create_folder))
        .route("/drive/v3/files/:id", get(read_file))
        .route("/drive/v3/about", get(about))
        .route("/upload/drive/v3/files", post(start_create_upload))
        .route("/upload/drive/v3/files/:id", patch(start_update_upload))
        .route("/upload-session/:id", put(upload_content))
        .route("/auth/google/refresh", post(refresh_token))
        .with_state(state)
}

// Local network appliance

pub const SYNC_KEY: &str = "pairing-key";

#[derive(Default)]
pub struct ApplianceState {
    /// `<collection>/<key>` → last body
    pub objects: Mutex<BTreeMap<String, Value>>,
    /// `<collection>` → name → document
    pub documents: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    /// Object keys answered with a 422
    pub refused_keys: Mutex<HashSet<String>>,
    /// Object keys answered with a 500
    pub failing_keys: Mutex<HashSet<String>>,
    pub folder_paths: Mutex<Vec<String>>,
    pub sync_keys: Mutex<Vec<String>>,
}

type ApplianceShared = Arc<ApplianceState>;

fn record_headers(state: &ApplianceState, headers: &HeaderMap) {
    if let Some(key) = headers.get("x-sync-key").and_then(|v| v.to_str().ok()) {
        state.sync_keys.lock().push(key.to_string());
    }
    if let Some(path) = headers.get("x-folder-path").and_then(|v| v.to_str().ok()) {
        state.folder_paths.lock().push(path.to_string());
    }
}

async fn status(Json(body): Json<Value>) -> StatusCode {
    if body["syncKey"] == SYNC_KEY {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn put_object(
    State(state): State<ApplianceShared>,
    headers: HeaderMap,
    Path((collection, key)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    record_headers(&state, &headers);
    if state.refused_keys.lock().contains(&key) {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    if state.failing_keys.lock().contains(&key) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state
        .objects
        .lock()
        .insert(format!("{}/{}", collection, key), body);
    StatusCode::OK
}

async fn put_document(
    State(state): State<ApplianceShared>,
    headers: HeaderMap,
    Path((collection, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    record_headers(&state, &headers);
    state
        .documents
        .lock()
        .entry(collection)
        .or_default()
        .insert(name, body);
    StatusCode::OK
}

async fn list_documents(
    State(state): State<ApplianceShared>,
    Path(collection): Path<String>,
) -> Response {
    match state.documents.lock().get(&collection) {
        Some(docs) if !docs.is_empty() => docs.keys().cloned().collect::<Vec<_>>().join(",").into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_document(
    State(state): State<ApplianceShared>,
    Path((collection, name)): Path<(String, String)>,
) -> Response {
    match state
        .documents
        .lock()
        .get(&collection)
        .and_then(|docs| docs.get(&name).cloned())
    {
        Some(doc) => Json(doc).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn appliance_router(state: ApplianceShared) -> Router {
    Router::new()
        .route("/status", post(status))
        .route("/backup/:collection", get(list_documents))
        .route("/backup/:collection/:name", put(put_document).get(get_document))
        .route("/:collection/:key", put(put_object))
        .with_state(state)
}
