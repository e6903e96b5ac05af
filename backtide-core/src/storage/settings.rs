//! Persistent key/value settings
//!
//! Values are JSON so callers can store timestamps, flags and small records
//! under the same interface. [`BackupInfoStorage`] is the typed view the
//! backup engine uses.

use crate::error::BacktideResult;
use crate::types::BackupStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

// Keys shared with the UI, so their spelling is fixed
pub const LAST_BACKUP: &str = "lastBackup";
pub const LAST_BACKUP_FINISH: &str = "lastBackupFinish";
pub const LAST_PROBLEM_NOTIF_SHOWN: &str = "lastProblemNotifShown";
pub const AUTOMATIC_BACKUPS_ENABLED: &str = "backup.automatic-backups-enabled";
pub const SAVE_BLOBS: &str = "backup.save-blobs";
pub const BACKUP_STATUS: &str = "backup-status";
pub const BACKEND_LOCATION: &str = "backup.location";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> BacktideResult<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> BacktideResult<()>;
    async fn remove(&self, key: &str) -> BacktideResult<()>;
}

/// Settings persisted in a redb table
pub struct RedbSettingsStore {
    database: Arc<Database>,
}

impl RedbSettingsStore {
    pub fn open(path: impl AsRef<Path>) -> BacktideResult<Self> {
        let database = Arc::new(Database::create(path.as_ref())?);
        Self::new(database)
    }

    pub fn new(database: Arc<Database>) -> BacktideResult<Self> {
        let write_txn = database.begin_write()?;
        write_txn.open_table(SETTINGS_TABLE)?;
        write_txn.commit()?;
        Ok(Self { database })
    }
}

#[async_trait]
impl SettingsStore for RedbSettingsStore {
    async fn get(&self, key: &str) -> BacktideResult<Option<Value>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> BacktideResult<()> {
        let bytes = serde_json::to_vec(&value)?;
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> BacktideResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory settings, for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> BacktideResult<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> BacktideResult<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> BacktideResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Typed access to the backup bookkeeping stored in settings
#[derive(Clone)]
pub struct BackupInfoStorage {
    settings: Arc<dyn SettingsStore>,
}

impl BackupInfoStorage {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub async fn retrieve_date(&self, key: &str) -> BacktideResult<Option<DateTime<Utc>>> {
        match self.settings.get(key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(None),
        }
    }

    pub async fn store_date(&self, key: &str, date: DateTime<Utc>) -> BacktideResult<()> {
        self.settings.set(key, serde_json::to_value(date)?).await
    }

    pub async fn remove(&self, key: &str) -> BacktideResult<()> {
        self.settings.remove(key).await
    }

    /// Forget every timestamp of past runs
    pub async fn clear(&self) -> BacktideResult<()> {
        for key in [LAST_BACKUP, LAST_BACKUP_FINISH, LAST_PROBLEM_NOTIF_SHOWN] {
            self.settings.remove(key).await?;
        }
        Ok(())
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> BacktideResult<bool> {
        Ok(match self.settings.get(key).await? {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s != "false",
            _ => default,
        })
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> BacktideResult<()> {
        self.settings.set(key, Value::Bool(value)).await
    }

    pub async fn get_string(&self, key: &str) -> BacktideResult<Option<String>> {
        Ok(match self.settings.get(key).await? {
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
    }

    pub async fn set_string(&self, key: &str, value: &str) -> BacktideResult<()> {
        self.settings.set(key, Value::String(value.to_string())).await
    }

    /// Blobs are saved unless explicitly turned off
    pub async fn store_blobs(&self) -> BacktideResult<bool> {
        self.get_bool(SAVE_BLOBS, true).await
    }

    pub async fn backup_status(&self) -> BacktideResult<BackupStatus> {
        match self.settings.get(BACKUP_STATUS).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BackupStatus::no_backup()),
        }
    }

    pub async fn set_backup_status(&self, status: &BackupStatus) -> BacktideResult<()> {
        self.settings
            .set(BACKUP_STATUS, serde_json::to_value(status)?)
            .await
    }
}
