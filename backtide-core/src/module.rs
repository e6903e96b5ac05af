//! Backup module: the facade that wires storage, backend and procedure
//! together and owns automatic scheduling and problem notifications.

use crate::abstractions::time::Clock;
use crate::backend::{BackendContext, BackendRegistry, BackupBackend};
use crate::config::{BacktideConfig, EngineConfig};
use crate::error::{BacktideError, BacktideResult};
use crate::notifications::Notifier;
use crate::procedure::{BackupEvent, BackupProcedure, ProcedureConfig, RunOutcome};
use crate::storage::settings::{
    AUTOMATIC_BACKUPS_ENABLED, BACKEND_LOCATION, LAST_BACKUP, LAST_BACKUP_FINISH,
    LAST_PROBLEM_NOTIF_SHOWN, SAVE_BLOBS,
};
use crate::storage::{BackupInfoStorage, ChangeLog, LocalStore, SettingsStore};
use crate::types::{BackupProgressInfo, BackupStatus, NotificationId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collaborators needed to build a [`BackupModule`]
pub struct ModuleDependencies {
    pub config: BacktideConfig,
    pub local_store: Arc<dyn LocalStore>,
    pub change_log: Arc<ChangeLog>,
    pub settings: Arc<dyn SettingsStore>,
    pub registry: BackendRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// When the next backup happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextBackup {
    Running,
    At(DateTime<Utc>),
    NotScheduled,
}

impl Serialize for NextBackup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NextBackup::Running => serializer.serialize_str("running"),
            NextBackup::At(time) => serializer.serialize_i64(time.timestamp_millis()),
            NextBackup::NotScheduled => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTimes {
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_backup: Option<DateTime<Utc>>,
    pub next_backup: NextBackup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSize {
    pub collection: String,
    pub objects: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSizeEstimate {
    pub collections: Vec<CollectionSize>,
    pub total_objects: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct ScheduledBackup {
    handle: Option<JoinHandle<()>>,
    due: Option<DateTime<Utc>>,
}

/// Marks a restore as running until dropped
pub struct RestoreGuard {
    module: Weak<BackupModule>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let Some(module) = self.module.upgrade() else {
            return;
        };
        module.restore_running.store(false, Ordering::SeqCst);

        // automatic backups were held off for the restore
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = module.schedule_automatic_backup_if_enabled().await {
                    warn!("Failed to reschedule automatic backup after restore: {}", e);
                }
            });
        }
    }
}

pub struct BackupModule {
    config: EngineConfig,
    context: BackendContext,
    registry: BackendRegistry,
    local_store: Arc<dyn LocalStore>,
    change_log: Arc<ChangeLog>,
    info_storage: BackupInfoStorage,
    procedure: Arc<BackupProcedure>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    location: RwLock<String>,
    restore_running: AtomicBool,
    scheduled: Mutex<ScheduledBackup>,
}

impl BackupModule {
    /// Build the module with the backend chosen in settings
    pub async fn new(deps: ModuleDependencies) -> BacktideResult<Arc<Self>> {
        let info_storage = BackupInfoStorage::new(deps.settings.clone());
        let context = BackendContext {
            config: deps.config.clone(),
            settings: deps.settings.clone(),
            clock: deps.clock.clone(),
        };

        let location = info_storage
            .get_string(BACKEND_LOCATION)
            .await?
            .unwrap_or_else(|| deps.config.engine.default_backend.clone());
        let backend = deps.registry.create_backend(&location, &context)?;
        info!("Using backup backend '{}'", location);

        let procedure = Arc::new(BackupProcedure::new(
            deps.local_store.clone(),
            deps.change_log.clone(),
            info_storage.clone(),
            backend,
            deps.clock.clone(),
            ProcedureConfig::from(&deps.config.engine),
        ));

        Ok(Arc::new(Self {
            config: deps.config.engine,
            context,
            registry: deps.registry,
            local_store: deps.local_store,
            change_log: deps.change_log,
            info_storage,
            procedure,
            notifier: deps.notifier,
            clock: deps.clock,
            location: RwLock::new(location),
            restore_running: AtomicBool::new(false),
            scheduled: Mutex::new(ScheduledBackup::default()),
        }))
    }

    pub fn procedure(&self) -> &Arc<BackupProcedure> {
        &self.procedure
    }

    pub fn change_log(&self) -> &Arc<ChangeLog> {
        &self.change_log
    }

    pub fn backend(&self) -> Arc<dyn BackupBackend> {
        self.procedure.backend()
    }

    pub fn info_storage(&self) -> &BackupInfoStorage {
        &self.info_storage
    }

    // Backend selection

    pub fn backend_location(&self) -> String {
        self.location.read().clone()
    }

    pub fn available_locations(&self) -> Vec<&str> {
        self.registry.list_available_backends()
    }

    /// Persist a new location and swap the active backend
    pub async fn set_backend_location(&self, location: &str) -> BacktideResult<()> {
        if self.procedure.is_running() {
            return Err(BacktideError::invalid_operation(
                "set_backend_location",
                "a backup is running",
            ));
        }

        let backend = self.registry.create_backend(location, &self.context)?;
        self.info_storage.set_string(BACKEND_LOCATION, location).await?;
        self.procedure.set_backend(backend);
        *self.location.write() = location.to_string();
        info!("Switched backup backend to '{}'", location);
        Ok(())
    }

    pub async fn is_backend_authenticated(&self) -> bool {
        self.backend().is_authenticated().await
    }

    pub fn login_url(&self) -> Option<String> {
        self.backend().login_url()
    }

    pub async fn handle_login_redirected_back(&self, location: &str) -> BacktideResult<()> {
        self.backend().handle_login_redirected_back(location).await
    }

    // Run control

    pub fn get_info(&self) -> Option<BackupProgressInfo> {
        self.procedure.info()
    }

    pub fn pause_backup(&self) -> bool {
        self.procedure.pause()
    }

    pub fn resume_backup(&self) -> bool {
        self.procedure.resume()
    }

    pub async fn cancel_backup(&self) -> BacktideResult<()> {
        self.procedure.cancel().await
    }

    /// User-requested backup
    pub async fn start_backup(self: &Arc<Self>) -> BacktideResult<bool> {
        Ok(self.start_backup_with_events().await?.is_some())
    }

    /// User-requested backup, handing back the run's events from the first
    /// one on. `None` when no run was started.
    pub async fn start_backup_with_events(
        self: &Arc<Self>,
    ) -> BacktideResult<Option<broadcast::Receiver<BackupEvent>>> {
        if self.procedure.is_running() {
            return Ok(None);
        }
        if self.restore_running.load(Ordering::SeqCst) {
            return Err(BacktideError::invalid_operation(
                "start_backup",
                "cannot run a backup while a restore is in progress",
            ));
        }
        self.launch_backup().await
    }

    /// Flag a restore as running for as long as the guard lives
    pub fn mark_restore_running(self: &Arc<Self>) -> BacktideResult<RestoreGuard> {
        if self.procedure.is_running() {
            return Err(BacktideError::invalid_operation(
                "restore",
                "cannot restore while a backup is running",
            ));
        }
        if self.restore_running.swap(true, Ordering::SeqCst) {
            return Err(BacktideError::invalid_operation(
                "restore",
                "a restore is already running",
            ));
        }
        self.clear_automatic_backup();
        Ok(RestoreGuard {
            module: Arc::downgrade(self),
        })
    }

    /// Start a run if the backend is reachable. Returns whether a run started.
    pub async fn do_backup(self: &Arc<Self>) -> BacktideResult<bool> {
        Ok(self.launch_backup().await?.is_some())
    }

    async fn launch_backup(self: &Arc<Self>) -> BacktideResult<Option<broadcast::Receiver<BackupEvent>>> {
        self.clear_automatic_backup();
        if self.restore_running.load(Ordering::SeqCst) {
            info!("Restore in progress, skipping backup");
            self.schedule_automatic_backup_if_enabled().await?;
            return Ok(None);
        }
        self.change_log.start_recording();

        let backend = self.backend();
        if !backend.is_reachable().await {
            warn!("Backup backend '{}' is not reachable", backend.backend_type());
            self.maybe_show_backup_problem_notif(NotificationId::IncrementalBackupDown)
                .await?;
            self.schedule_automatic_backup_if_enabled().await?;
            return Ok(None);
        }

        let Some(mut run) = self.procedure.run() else {
            return Ok(None);
        };
        let events = run.take_events();

        let module = self.clone();
        tokio::spawn(async move {
            let outcome = match run.wait().await {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Failed(Arc::new(e)),
            };
            if let Err(e) = module.after_run(outcome).await {
                warn!("Post-backup bookkeeping failed: {}", e);
            }
        });
        Ok(Some(events))
    }

    async fn after_run(self: &Arc<Self>, outcome: RunOutcome) -> BacktideResult<()> {
        match outcome {
            RunOutcome::Success => {
                info!("Backup finished");
            }
            RunOutcome::Failed(e) => {
                warn!("Backup run failed: {}", e);
                let id = self.backend().notification_for_failure().await;
                self.maybe_show_backup_problem_notif(id).await?;
            }
            RunOutcome::Cancelled => return Ok(()),
        }
        self.schedule_automatic_backup_if_enabled().await
    }

    // Automatic backups

    pub async fn is_automatic_backup_enabled(&self) -> BacktideResult<bool> {
        self.info_storage.get_bool(AUTOMATIC_BACKUPS_ENABLED, false).await
    }

    pub async fn enable_automatic_backup(self: &Arc<Self>) -> BacktideResult<()> {
        self.info_storage.set_bool(AUTOMATIC_BACKUPS_ENABLED, true).await?;
        self.schedule_automatic_backup_if_enabled().await
    }

    pub async fn disable_automatic_backup(&self) -> BacktideResult<()> {
        self.info_storage.set_bool(AUTOMATIC_BACKUPS_ENABLED, false).await?;
        self.clear_automatic_backup();
        Ok(())
    }

    pub async fn schedule_automatic_backup_if_enabled(self: &Arc<Self>) -> BacktideResult<()> {
        if self.is_automatic_backup_enabled().await? {
            self.schedule_automatic_backup();
        }
        Ok(())
    }

    /// Schedule one backup an interval from now. No-op if one is already
    /// pending or a run is active.
    pub fn schedule_automatic_backup(self: &Arc<Self>) {
        let mut scheduled = self.scheduled.lock();
        if scheduled.handle.is_some() || self.procedure.is_running() {
            return;
        }

        let interval = self.config.automatic_interval;
        let due = self.clock.now()
            + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
        let module = Arc::downgrade(self);

        scheduled.due = Some(due);
        scheduled.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(module) = module.upgrade() else {
                return;
            };
            // detach rather than abort, this task is the one running
            module.scheduled.lock().handle.take();
            if let Err(e) = module.do_backup().await {
                warn!("Automatic backup failed to start: {}", e);
            }
        }));
        debug!("Next automatic backup at {}", due);
    }

    pub fn clear_automatic_backup(&self) {
        let mut scheduled = self.scheduled.lock();
        if let Some(handle) = scheduled.handle.take() {
            handle.abort();
            debug!("Cleared pending automatic backup");
        }
    }

    pub fn has_scheduled_backup(&self) -> bool {
        self.scheduled.lock().handle.is_some()
    }

    /// Resume change tracking at startup once a first backup exists
    pub async fn start_recording_changes_if_needed(self: &Arc<Self>) -> BacktideResult<()> {
        if !self.has_initial_backup().await? || self.change_log.is_recording() {
            return Ok(());
        }
        self.change_log.start_recording();
        self.schedule_automatic_backup_if_enabled().await
    }

    // Bookkeeping

    pub async fn has_initial_backup(&self) -> BacktideResult<bool> {
        Ok(self.info_storage.retrieve_date(LAST_BACKUP).await?.is_some())
    }

    pub async fn get_backup_times(&self) -> BacktideResult<BackupTimes> {
        let last_backup = self.info_storage.retrieve_date(LAST_BACKUP_FINISH).await?;
        let due = self.scheduled.lock().due;
        let next_backup = if self.procedure.is_running() {
            NextBackup::Running
        } else if self.is_automatic_backup_enabled().await? {
            due.map_or(NextBackup::NotScheduled, NextBackup::At)
        } else {
            NextBackup::NotScheduled
        };
        Ok(BackupTimes {
            last_backup,
            next_backup,
        })
    }

    pub async fn backup_status(&self) -> BacktideResult<BackupStatus> {
        self.info_storage.backup_status().await
    }

    pub async fn set_backup_blobs(&self, enabled: bool) -> BacktideResult<()> {
        self.info_storage.set_bool(SAVE_BLOBS, enabled).await
    }

    /// Drop every queued change and every record of past runs
    pub async fn forget_all_changes(&self) -> BacktideResult<()> {
        self.change_log.forget_all()?;
        self.info_storage.clear().await
    }

    /// Object count and serialized size of what a first backup would send
    pub async fn estimate_initial_backup_size(&self) -> BacktideResult<BackupSizeEstimate> {
        const PAGE: usize = 500;
        let mut estimate = BackupSizeEstimate {
            collections: Vec::new(),
            total_objects: 0,
            total_bytes: 0,
        };

        for collection in self.local_store.collections() {
            if collection.excluded_from_backup {
                continue;
            }
            let mut size = CollectionSize {
                collection: collection.name.clone(),
                objects: 0,
                bytes: 0,
            };
            let mut skip = 0;
            loop {
                let page = self.local_store.find_objects(&collection.name, PAGE, skip).await?;
                for object in &page {
                    size.objects += 1;
                    size.bytes += serde_json::to_vec(object)?.len() as u64;
                }
                if page.len() < PAGE {
                    break;
                }
                skip += page.len();
            }
            estimate.total_objects += size.objects;
            estimate.total_bytes += size.bytes;
            estimate.collections.push(size);
        }

        Ok(estimate)
    }

    // Notifications

    /// Raise `id` if backups have been failing for longer than the problem
    /// threshold and no notification was shown within the cooldown.
    /// Returns whether a notification was dispatched.
    pub async fn maybe_show_backup_problem_notif(&self, id: NotificationId) -> BacktideResult<bool> {
        let Some(last_backup) = self.info_storage.retrieve_date(LAST_BACKUP_FINISH).await? else {
            debug!("No finished backup yet, not raising {}", id);
            return Ok(false);
        };

        let now = self.clock.now();
        if elapsed(last_backup, now) < self.config.problem_threshold {
            return Ok(false);
        }

        let last_shown = self.info_storage.retrieve_date(LAST_PROBLEM_NOTIF_SHOWN).await?;
        if let Some(shown) = last_shown {
            if elapsed(shown, now) < self.config.notification_cooldown {
                return Ok(false);
            }
        }

        let already_stored = last_shown.map_or(false, |shown| shown > last_backup);
        self.notifier.dispatch(id, !already_stored).await?;
        self.info_storage.store_date(LAST_PROBLEM_NOTIF_SHOWN, now).await?;
        info!("Raised backup problem notification {}", id);
        Ok(true)
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
