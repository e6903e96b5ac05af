use super::control::{BackupEvent, BackupRun, RunControl, RunOutcome};
use crate::abstractions::time::{micros_to_datetime, Clock};
use crate::backend::{BackupBackend, BackupBatch};
use crate::config::EngineConfig;
use crate::error::BacktideResult;
use crate::storage::settings::{LAST_BACKUP, LAST_BACKUP_FINISH};
use crate::storage::{BackupInfoStorage, ChangeLog, LocalStore};
use crate::types::{
    strip_internal_fields, BackupProgressInfo, BackupState, BackupStatus, BackupStatusState,
    ChangeLogEntry, ChangeOperation, CollectionDefinition, ObjectChange,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ProcedureConfig {
    pub batch_size: usize,
    pub seed_chunk_size: usize,
    pub run_start_delay: Duration,
    pub cancel_settle_delay: Duration,
}

impl From<&EngineConfig> for ProcedureConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            seed_chunk_size: config.seed_chunk_size,
            run_start_delay: config.run_start_delay,
            cancel_settle_delay: config.cancel_settle_delay,
        }
    }
}

struct ActiveRun {
    control: watch::Sender<RunControl>,
    info: Arc<RwLock<BackupProgressInfo>>,
    events: broadcast::Sender<BackupEvent>,
    done: watch::Receiver<bool>,
}

/// Drains the change log into the backend, one run at a time
pub struct BackupProcedure {
    local_store: Arc<dyn LocalStore>,
    collections: HashMap<String, CollectionDefinition>,
    change_log: Arc<ChangeLog>,
    info_storage: BackupInfoStorage,
    backend: RwLock<Arc<dyn BackupBackend>>,
    clock: Arc<dyn Clock>,
    config: ProcedureConfig,
    active: Mutex<Option<ActiveRun>>,
}

impl BackupProcedure {
    pub fn new(
        local_store: Arc<dyn LocalStore>,
        change_log: Arc<ChangeLog>,
        info_storage: BackupInfoStorage,
        backend: Arc<dyn BackupBackend>,
        clock: Arc<dyn Clock>,
        config: ProcedureConfig,
    ) -> Self {
        let collections = local_store
            .collections()
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        Self {
            local_store,
            collections,
            change_log,
            info_storage,
            backend: RwLock::new(backend),
            clock,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> Arc<dyn BackupBackend> {
        self.backend.read().clone()
    }

    /// Takes effect from the next run
    pub fn set_backend(&self, backend: Arc<dyn BackupBackend>) {
        *self.backend.write() = backend;
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Progress of the current run, if any
    pub fn info(&self) -> Option<BackupProgressInfo> {
        self.active.lock().as_ref().map(|run| run.info.read().clone())
    }

    /// Attach to the events of the current run
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BackupEvent>> {
        self.active.lock().as_ref().map(|run| run.events.subscribe())
    }

    /// Start a run in the background. Returns `None` if one is already active.
    pub fn run(self: &Arc<Self>) -> Option<BackupRun> {
        let mut active = self.active.lock();
        if active.is_some() {
            debug!("Backup already running, ignoring run request");
            return None;
        }

        let (control_tx, control_rx) = watch::channel(RunControl::Running);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);
        let info = Arc::new(RwLock::new(BackupProgressInfo::preparing()));

        *active = Some(ActiveRun {
            control: control_tx,
            info: info.clone(),
            events: events_tx.clone(),
            done: done_rx,
        });
        drop(active);

        let procedure = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = procedure.drive(control_rx, &info, &events_tx).await;
            procedure.active.lock().take();
            let _ = done_tx.send(true);
            outcome
        });

        Some(BackupRun::new(events_rx, handle))
    }

    /// Pause a synching run at the next batch boundary
    pub fn pause(&self) -> bool {
        self.transition(BackupState::Synching, BackupState::Paused, RunControl::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(BackupState::Paused, BackupState::Synching, RunControl::Running)
    }

    fn transition(&self, from: BackupState, to: BackupState, control: RunControl) -> bool {
        let active = self.active.lock();
        let Some(run) = active.as_ref() else {
            return false;
        };

        let snapshot = {
            let mut info = run.info.write();
            if info.state != from {
                return false;
            }
            info.state = to;
            info.clone()
        };
        run.control.send_replace(control);
        let _ = run.events.send(BackupEvent::Info(snapshot));
        info!("Backup {:?}", to);
        true
    }

    /// Stop the current run, discard the change log and the last backup
    /// time so the next run starts with a full seed.
    pub async fn cancel(&self) -> BacktideResult<()> {
        let done = {
            let active = self.active.lock();
            active.as_ref().map(|run| {
                let snapshot = {
                    let mut info = run.info.write();
                    info.state = BackupState::Cancelled;
                    info.clone()
                };
                run.control.send_replace(RunControl::Cancelled);
                let _ = run.events.send(BackupEvent::Info(snapshot));
                run.done.clone()
            })
        };

        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }

        self.change_log.forget_all()?;
        self.info_storage.remove(LAST_BACKUP).await?;
        self.clock.sleep(self.config.cancel_settle_delay).await;
        info!("Backup cancelled and change log cleared");
        Ok(())
    }

    async fn drive(
        &self,
        control: watch::Receiver<RunControl>,
        info: &RwLock<BackupProgressInfo>,
        events: &broadcast::Sender<BackupEvent>,
    ) -> RunOutcome {
        let backend = self.backend();

        match self.execute(backend.as_ref(), control, info, events).await {
            Ok(RunOutcome::Success) => {
                if let Err(e) = self.info_storage.set_backup_status(&BackupStatus::success()).await {
                    warn!("Failed to store backup status: {}", e);
                }
                let _ = events.send(BackupEvent::Success);
                RunOutcome::Success
            }
            Ok(outcome) => {
                let _ = events.send(BackupEvent::Cancelled);
                outcome
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                self.record_failure(backend.as_ref()).await;
                let e = Arc::new(e);
                let _ = events.send(BackupEvent::Fail(e.clone()));
                RunOutcome::Failed(e)
            }
        }
    }

    async fn execute(
        &self,
        backend: &dyn BackupBackend,
        mut control: watch::Receiver<RunControl>,
        info: &RwLock<BackupProgressInfo>,
        events: &broadcast::Sender<BackupEvent>,
    ) -> BacktideResult<RunOutcome> {
        self.clock.sleep(self.config.run_start_delay).await;
        let _ = events.send(BackupEvent::Info(info.read().clone()));

        if self.info_storage.retrieve_date(LAST_BACKUP).await?.is_none() {
            info!("No previous backup found, queueing every object");
            self.change_log.forget_all()?;
            let queued = self.queue_initial_backup().await?;
            info!("Queued {} objects for the initial backup", queued);
        }

        let cut_off = self.change_log.tick();
        let queued = self.change_log.count_queued_by_collection(cut_off)?;
        let mut total = 0;
        for collection in self.backed_up_collections() {
            let count = queued.get(&collection.name).copied().unwrap_or(0);
            debug!("{} queued changes in {}", count, collection.name);
            total += count;
        }

        if *control.borrow() == RunControl::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }
        let snapshot = {
            let mut info = info.write();
            info.state = BackupState::Synching;
            info.total_changes = Some(total);
            info.processed_changes = Some(0);
            info.clone()
        };
        let _ = events.send(BackupEvent::Info(snapshot));
        info!("Starting incremental backup of {} changes", total);

        let schema_version = self.local_store.schema_version();
        let store_blobs = self.info_storage.store_blobs().await?;
        let mut stream = self.change_log.stream_changes(cut_off, self.config.batch_size);

        loop {
            let requested = control
                .wait_for(|c| *c != RunControl::Paused)
                .await
                .map(|c| *c)
                .unwrap_or(RunControl::Cancelled);
            if requested == RunControl::Cancelled {
                info!("Backup cancelled at batch boundary");
                return Ok(RunOutcome::Cancelled);
            }

            let Some(batch) = stream.next_batch()? else {
                break;
            };

            let changes = self.hydrate(batch.entries()).await?;
            let sent = changes.len();
            let outcome = backend
                .backup_changes(BackupBatch {
                    changes,
                    schema_version,
                    store_blobs,
                })
                .await?;
            batch.forget()?;

            if !outcome.rejected.is_empty() {
                warn!(
                    "Backend accepted {} of {} changes, re-queueing {} for the next run",
                    sent - outcome.rejected.len(),
                    sent,
                    outcome.rejected.len()
                );
                self.change_log.append_all(
                    outcome
                        .rejected
                        .into_iter()
                        .map(|c| (c.collection, c.object_pk, c.operation)),
                )?;
            }

            let snapshot = {
                let mut info = info.write();
                info.processed_changes = Some(info.processed_changes.unwrap_or(0) + sent as u64);
                info.clone()
            };
            debug!(
                "Backed up batch ({}/{})",
                snapshot.processed_changes.unwrap_or(0),
                total
            );
            let _ = events.send(BackupEvent::Info(snapshot));
        }

        self.info_storage
            .store_date(LAST_BACKUP, micros_to_datetime(cut_off))
            .await?;
        self.info_storage
            .store_date(LAST_BACKUP_FINISH, self.clock.now())
            .await?;
        info!("Finished incremental backup");
        Ok(RunOutcome::Success)
    }

    /// Status badge only moves to failed from a healthy state
    async fn record_failure(&self, backend: &dyn BackupBackend) {
        let notification = backend.notification_for_failure().await;
        let current = match self.info_storage.backup_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to read backup status: {}", e);
                return;
            }
        };
        if current.state != BackupStatusState::Fail {
            if let Err(e) = self
                .info_storage
                .set_backup_status(&BackupStatus::failed(notification))
                .await
            {
                warn!("Failed to store backup status: {}", e);
            }
        }
    }

    fn backed_up_collections(&self) -> Vec<CollectionDefinition> {
        self.local_store
            .collections()
            .into_iter()
            .filter(|c| !c.excluded_from_backup)
            .collect()
    }

    /// Put a `create` entry for every stored object into the change log
    async fn queue_initial_backup(&self) -> BacktideResult<usize> {
        let chunk_size = self.config.seed_chunk_size.max(1);
        let mut queued = 0;

        for collection in self.backed_up_collections() {
            let mut skip = 0;
            loop {
                let page = self
                    .local_store
                    .find_objects(&collection.name, chunk_size, skip)
                    .await?;
                let fetched = page.len();

                let entries: Vec<_> = page
                    .into_iter()
                    .filter_map(|object| object.get(&collection.pk_field).cloned())
                    .map(|pk| (collection.name.clone(), pk, ChangeOperation::Create))
                    .collect();
                if entries.len() < fetched {
                    warn!(
                        "Skipped {} objects without a primary key in {}",
                        fetched - entries.len(),
                        collection.name
                    );
                }
                queued += self.change_log.append_all(entries)?;

                if fetched < chunk_size {
                    break;
                }
                skip += fetched;
            }
        }

        Ok(queued)
    }

    /// Attach the current snapshot of each object to its change
    async fn hydrate(&self, entries: &[ChangeLogEntry]) -> BacktideResult<Vec<ObjectChange>> {
        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut change = ObjectChange::from_entry(entry.clone());
            if entry.operation != ChangeOperation::Delete {
                let object = self
                    .local_store
                    .find_by_pk(&entry.collection, &entry.object_pk)
                    .await?;
                change.object = match object {
                    Some(Value::Object(fields)) => {
                        let mut fields = strip_internal_fields(fields);
                        if let Some(definition) = self.collections.get(&entry.collection) {
                            for field in &definition.blob_fields {
                                match fields.remove(field) {
                                    Some(Value::Null) | None => {}
                                    Some(blob) => {
                                        change.blobs.insert(field.clone(), blob);
                                    }
                                }
                            }
                        }
                        Some(Value::Object(fields))
                    }
                    other => other,
                };
            }
            changes.push(change);
        }
        Ok(changes)
    }
}
