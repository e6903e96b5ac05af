mod common;

use backtide_backends::remote::{NewTokens, RemoteStoreBackend};
use backtide_core::abstractions::MockClock;
use backtide_core::backend::{BackupBackend, BackupBatch, CHANGE_SETS_COLLECTION, IMAGES_COLLECTION};
use backtide_core::config::RemoteStoreConfig;
use backtide_core::error::BacktideError;
use backtide_core::storage::{BackupInfoStorage, LocalStore, MemorySettingsStore};
use backtide_core::types::{BackupStatusState, NotificationId};
use chrono::{TimeZone, Utc};
use common::{change, drive_router, spawn_server, DriveState, Engine};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct RemoteFixture {
    state: Arc<DriveState>,
    settings: Arc<MemorySettingsStore>,
    clock: Arc<MockClock>,
    config: RemoteStoreConfig,
}

impl RemoteFixture {
    async fn start() -> Self {
        let state = Arc::new(DriveState::default());
        *state.quota.lock() = (Some("1000".to_string()), "10".to_string());
        let base_url = spawn_server(drive_router(state.clone())).await;

        let config = RemoteStoreConfig {
            api_origin: base_url.clone(),
            cloud_origin: base_url,
            retry_interval: Duration::from_millis(10),
            retry_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        Self {
            state,
            settings: Arc::new(MemorySettingsStore::new()),
            clock: Arc::new(MockClock::with_time(
                Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            )),
            config,
        }
    }

    fn backend(&self) -> RemoteStoreBackend {
        RemoteStoreBackend::new(self.config.clone(), self.settings.clone(), self.clock.clone()).unwrap()
    }

    async fn logged_in_backend(&self, expires_in: Duration) -> RemoteStoreBackend {
        let backend = self.backend();
        backend
            .tokens()
            .handle_new_tokens(NewTokens {
                access_token: "access-1".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_in,
            })
            .await
            .unwrap();
        backend
    }
}

fn batch(store_blobs: bool) -> BackupBatch {
    let mut with_blob = change(
        7,
        "pages",
        json!("https://a.com"),
        Some(json!({"url": "https://a.com", "title": "A"})),
    );
    with_blob
        .blobs
        .insert("screenshot".to_string(), json!("data:image/png;base64,AAA"));
    BackupBatch {
        changes: vec![
            with_blob,
            change(9, "tags", json!(1), Some(json!({"id": 1, "name": "x"}))),
            change(12, "tags", json!(2), None),
        ],
        schema_version: 20240101,
        store_blobs,
    }
}

#[tokio::test]
async fn test_backup_writes_change_sets_and_images() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;

    let outcome = backend.backup_changes(batch(true)).await.unwrap();
    assert!(outcome.rejected.is_empty());

    assert_eq!(
        fixture.state.folder_names("appDataFolder"),
        [CHANGE_SETS_COLLECTION, IMAGES_COLLECTION]
            .into_iter()
            .map(String::from)
            .collect::<HashSet<_>>()
    );

    let change_sets = fixture.state.folder_contents(CHANGE_SETS_COLLECTION);
    let doc = &change_sets["00000000000000000012"];
    assert_eq!(doc["version"], json!(20240101));
    assert_eq!(doc["changes"].as_array().unwrap().len(), 3);
    assert!(!doc.to_string().contains("base64"));

    let images = fixture.state.folder_contents(IMAGES_COLLECTION);
    let images_doc = &images["00000000000000000012"];
    assert_eq!(images_doc["images"][0]["field"], json!("screenshot"));
    assert_eq!(images_doc["images"][0]["pk"], json!("https://a.com"));
}

#[tokio::test]
async fn test_no_images_document_without_blob_storage() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;

    backend.backup_changes(batch(false)).await.unwrap();

    assert_eq!(fixture.state.folder_contents(CHANGE_SETS_COLLECTION).len(), 1);
    assert!(fixture.state.folder_contents(IMAGES_COLLECTION).is_empty());
}

#[tokio::test]
async fn test_storing_same_name_overwrites() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;

    backend.backup_changes(batch(false)).await.unwrap();
    let mut second = batch(false);
    second.changes.truncate(1);
    second.changes.push(change(12, "tags", json!(3), None));
    backend.backup_changes(second).await.unwrap();

    let change_sets = fixture.state.folder_contents(CHANGE_SETS_COLLECTION);
    assert_eq!(change_sets.len(), 1);
    assert_eq!(
        change_sets["00000000000000000012"]["changes"].as_array().unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_list_and_retrieve_across_pages() {
    let fixture = RemoteFixture::start().await;
    let writer = fixture.logged_in_backend(Duration::from_secs(3600)).await;
    for ts in [3, 5, 8] {
        let mut batch = batch(false);
        batch.changes = vec![change(ts, "tags", json!(ts), Some(json!({"id": ts})))];
        writer.backup_changes(batch).await.unwrap();
    }

    // a fresh backend has an empty folder cache and must page through
    let reader = fixture.backend();
    let names = reader.list_objects(CHANGE_SETS_COLLECTION).await.unwrap();
    assert_eq!(
        names,
        vec![
            "00000000000000000003",
            "00000000000000000005",
            "00000000000000000008"
        ]
    );

    let doc = reader
        .retrieve_object(CHANGE_SETS_COLLECTION, "00000000000000000005")
        .await
        .unwrap();
    assert_eq!(doc["changes"][0]["objectPk"], json!(5));

    assert!(reader.list_objects("nothing-here").await.unwrap().is_empty());
    assert!(matches!(
        reader
            .retrieve_object(CHANGE_SETS_COLLECTION, "00000000000000000099")
            .await,
        Err(BacktideError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;
    fixture.state.about_failures.store(2, Ordering::SeqCst);

    let quota = backend.client().storage_quota().await.unwrap();
    assert_eq!(quota.limit.as_deref(), Some("1000"));
    assert_eq!(fixture.state.about_calls.load(Ordering::SeqCst), 3);

    let status = BackupInfoStorage::new(fixture.settings.clone())
        .backup_status()
        .await
        .unwrap();
    assert_ne!(status.state, BackupStatusState::Fail);
}

#[tokio::test]
async fn test_backup_run_completes_through_upload_server_errors() {
    let fixture = RemoteFixture::start().await;
    let backend = Arc::new(fixture.logged_in_backend(Duration::from_secs(3600)).await);
    let engine = Engine::new(fixture.settings.clone());
    engine.store.create_object("tags", json!({"id": 1, "name": "x"})).await.unwrap();
    engine.store.create_object("tags", json!({"id": 2, "name": "y"})).await.unwrap();
    fixture.state.upload_failures.store(2, Ordering::SeqCst);
    fixture.state.content_failures.store(2, Ordering::SeqCst);

    let procedure = engine.procedure(backend, 10);
    let run = procedure.run().unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), run.wait())
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.is_success());
    assert!(engine.change_log.is_empty().unwrap());
    assert_eq!(fixture.state.upload_calls.load(Ordering::SeqCst), 3);
    assert_eq!(fixture.state.content_calls.load(Ordering::SeqCst), 3);

    let change_sets = fixture.state.folder_contents(CHANGE_SETS_COLLECTION);
    assert_eq!(change_sets.len(), 1);
    let doc = change_sets.values().next().unwrap();
    let pks: HashSet<String> = doc["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["objectPk"].to_string())
        .collect();
    assert_eq!(pks, ["1", "2"].into_iter().map(String::from).collect::<HashSet<_>>());

    let status = engine.info.backup_status().await.unwrap();
    assert_ne!(status.state, BackupStatusState::Fail);
}

#[tokio::test]
async fn test_exhausted_retries_mark_backup_failed() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;
    fixture.state.about_failures.store(u32::MAX, Ordering::SeqCst);

    let err = backend.client().storage_quota().await.unwrap_err();
    assert!(matches!(err, BacktideError::Timeout { .. }));
    assert!(fixture.state.about_calls.load(Ordering::SeqCst) > 1);

    let status = BackupInfoStorage::new(fixture.settings.clone())
        .backup_status()
        .await
        .unwrap();
    assert_eq!(status.state, BackupStatusState::Fail);
    assert_eq!(status.backup_id, "drive_size_empty");
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_before_use() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(10 * 60)).await;

    backend.backup_changes(batch(false)).await.unwrap();

    assert_eq!(fixture.state.refresh_calls.load(Ordering::SeqCst), 1);
    let seen = fixture.state.tokens_seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|token| token == "fresh-access"));

    let tokens = backend.tokens().tokens().await.unwrap();
    assert_eq!(tokens.access_token.as_deref(), Some("fresh-access"));
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
}

#[tokio::test]
async fn test_backup_without_login_fails() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.backend();

    assert!(!backend.is_authenticated().await);
    let err = backend.backup_changes(batch(false)).await.unwrap_err();
    assert!(matches!(err, BacktideError::Authentication { .. }));
    assert!(fixture.state.files.lock().is_empty());
}

#[tokio::test]
async fn test_login_redirect_stores_tokens() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.backend();

    assert!(backend.is_reachable().await);
    backend
        .handle_login_redirected_back(
            "/backup/auth/callback?access_token=abc&refresh_token=refresh-1&expires_in=3600",
        )
        .await
        .unwrap();

    assert!(backend.is_authenticated().await);
    // survives a restart through settings
    let restarted = fixture.backend();
    assert!(restarted.is_authenticated().await);
    assert_eq!(
        restarted.tokens().get_access_token().await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn test_failure_notification_follows_quota() {
    let fixture = RemoteFixture::start().await;
    let backend = fixture.logged_in_backend(Duration::from_secs(3600)).await;

    assert_eq!(backend.notification_for_failure().await, NotificationId::BackupError);

    *fixture.state.quota.lock() = (Some("1000".to_string()), "1000".to_string());
    assert_eq!(
        backend.notification_for_failure().await,
        NotificationId::DriveSizeEmpty
    );
}
