// Common test utilities and helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use backtide_core::abstractions::MockClock;
use backtide_core::backend::{
    BackendContext, BackendFactory, BackupBackend, BackupBatch, BatchOutcome,
};
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::notifications::Notifier;
use backtide_core::procedure::{BackupProcedure, ProcedureConfig};
use backtide_core::storage::{
    BackupInfoStorage, ChangeLog, ChangeTracker, LocalStore, MemorySettingsStore, RedbObjectStore,
};
use backtide_core::types::{CollectionDefinition, NotificationId};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that keeps every batch in memory
pub struct FakeBackend {
    /// Calls to `backup_changes`, counted before the gate
    pub calls: AtomicU32,
    pub batches: Mutex<Vec<BackupBatch>>,
    pub reachable: AtomicBool,
    pub authenticated: AtomicBool,
    /// Number of upcoming calls that fail
    pub failures: AtomicU32,
    /// Primary keys refused by the backend
    pub rejected_pks: Mutex<Vec<Value>>,
    pub failure_notification: Mutex<NotificationId>,
    /// When set, each backup call takes one permit first
    pub gate: Option<Semaphore>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            batches: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            rejected_pks: Mutex::new(Vec::new()),
            failure_notification: Mutex::new(NotificationId::BackupError),
            gate: None,
        }
    }

    /// Backend whose calls block until permits are added
    pub fn gated(permits: usize) -> Self {
        Self {
            gate: Some(Semaphore::new(permits)),
            ..Self::new()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|b| b.changes.len()).collect()
    }

    pub fn delivered_pks(&self) -> Vec<Value> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.changes.iter().map(|c| c.object_pk.clone()))
            .collect()
    }
}

#[async_trait]
impl BackupBackend for FakeBackend {
    fn backend_type(&self) -> &'static str {
        "fake"
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn backup_changes(&self, batch: BackupBatch) -> BacktideResult<BatchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| BacktideError::internal(e.to_string()))?
                .forget();
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BacktideError::http_status("fake upload", 403));
        }

        let rejected_pks = self.rejected_pks.lock().clone();
        let rejected = batch
            .changes
            .iter()
            .filter(|c| rejected_pks.contains(&c.object_pk))
            .cloned()
            .collect();
        self.batches.lock().push(batch);
        Ok(BatchOutcome { rejected })
    }

    async fn list_objects(&self, _collection: &str) -> BacktideResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn retrieve_object(&self, collection: &str, name: &str) -> BacktideResult<Value> {
        Err(BacktideError::not_found(format!("{}/{}", collection, name)))
    }

    fn login_url(&self) -> Option<String> {
        None
    }

    async fn handle_login_redirected_back(&self, _location: &str) -> BacktideResult<()> {
        Ok(())
    }

    async fn notification_for_failure(&self) -> NotificationId {
        *self.failure_notification.lock()
    }
}

/// Factory handing out a shared [`FakeBackend`]
pub struct FakeFactory {
    pub name: &'static str,
    pub backend: Arc<FakeBackend>,
}

impl BackendFactory for FakeFactory {
    fn create_backend(&self, _context: &BackendContext) -> BacktideResult<Arc<dyn BackupBackend>> {
        Ok(self.backend.clone())
    }

    fn backend_type(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "In-memory test backend"
    }
}

/// Notifier that remembers what it was asked to show
#[derive(Default)]
pub struct RecordingNotifier {
    pub dispatched: Mutex<Vec<(NotificationId, bool)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(&self, id: NotificationId, store: bool) -> BacktideResult<()> {
        self.dispatched.lock().push((id, store));
        Ok(())
    }
}

pub fn test_collections() -> Vec<CollectionDefinition> {
    let version = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    vec![
        CollectionDefinition::new("pages", "url", version).with_blob_fields(["screenshot"]),
        CollectionDefinition::new("tags", "id", version),
        CollectionDefinition::new("backupChanges", "timestamp", version).excluded(),
    ]
}

/// Object store, change log and settings wired the way the binary does it
pub struct Harness {
    pub store: Arc<RedbObjectStore>,
    pub change_log: Arc<ChangeLog>,
    pub settings: Arc<MemorySettingsStore>,
    pub info: BackupInfoStorage,
    pub clock: Arc<MockClock>,
    pub temp_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::with_time(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let collections = test_collections();

        let store = Arc::new(
            RedbObjectStore::open(temp_dir.path().join("objects.redb"), collections.clone()).unwrap(),
        );
        let change_log = Arc::new(
            ChangeLog::open(temp_dir.path().join("change_log.redb"), clock.clone()).unwrap(),
        );
        store.register_hook(Arc::new(ChangeTracker::new(change_log.clone(), &collections)));

        let settings = Arc::new(MemorySettingsStore::new());
        let info = BackupInfoStorage::new(settings.clone());

        Self {
            store,
            change_log,
            settings,
            info,
            clock,
            temp_dir,
        }
    }

    pub fn procedure(&self, backend: Arc<FakeBackend>, batch_size: usize) -> Arc<BackupProcedure> {
        Arc::new(BackupProcedure::new(
            self.store.clone(),
            self.change_log.clone(),
            self.info.clone(),
            backend,
            self.clock.clone(),
            ProcedureConfig {
                batch_size,
                seed_chunk_size: 2,
                run_start_delay: Duration::from_millis(200),
                cancel_settle_delay: Duration::from_secs(1),
            },
        ))
    }

    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        self.store.clone()
    }
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> BacktideResult<()>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(BacktideError::timeout_error("wait_for_condition", timeout))
}
