//! Shared domain types for the backup engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of mutation applied to a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Delete => write!(f, "delete"),
        }
    }
}

/// One row of the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// Microseconds since the epoch, unique across the log
    pub timestamp: u64,
    pub collection: String,
    pub object_pk: Value,
    pub operation: ChangeOperation,
}

/// A change-log entry hydrated with the current object snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectChange {
    pub timestamp: u64,
    pub collection: String,
    pub object_pk: Value,
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Binary payload fields split off the snapshot during hydration
    #[serde(skip)]
    pub blobs: BTreeMap<String, Value>,
}

impl ObjectChange {
    /// Change without a snapshot, as used for deletes
    pub fn from_entry(entry: ChangeLogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            collection: entry.collection,
            object_pk: entry.object_pk,
            operation: entry.operation,
            object: None,
            blobs: BTreeMap::new(),
        }
    }
}

/// Remove fields that only exist for local full-text search
pub fn strip_internal_fields(object: Map<String, Value>) -> Map<String, Value> {
    object
        .into_iter()
        .filter(|(key, _)| key != "terms" && !key.contains("_terms"))
        .collect()
}

/// Registry entry describing one collection of the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDefinition {
    pub name: String,
    /// Field of each object holding its primary key
    pub pk_field: String,
    #[serde(default)]
    pub excluded_from_backup: bool,
    /// Fields holding binary payloads (images, favicons)
    #[serde(default)]
    pub blob_fields: Vec<String>,
    /// Schema version this collection was last changed in
    pub version: DateTime<Utc>,
}

impl CollectionDefinition {
    pub fn new(name: impl Into<String>, pk_field: impl Into<String>, version: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            pk_field: pk_field.into(),
            excluded_from_backup: false,
            blob_fields: Vec::new(),
            version,
        }
    }

    pub fn excluded(mut self) -> Self {
        self.excluded_from_backup = true;
        self
    }

    pub fn with_blob_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blob_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Stage of a running backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Preparing,
    Synching,
    Paused,
    Cancelled,
}

/// Progress of the current run, reported to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgressInfo {
    pub state: BackupState,
    pub total_changes: Option<u64>,
    pub processed_changes: Option<u64>,
}

impl BackupProgressInfo {
    pub fn preparing() -> Self {
        Self {
            state: BackupState::Preparing,
            total_changes: None,
            processed_changes: None,
        }
    }
}

/// User-facing notifications the engine can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationId {
    /// The backend was unreachable for longer than the problem threshold
    IncrementalBackupDown,
    /// A run failed for a reason other than quota
    BackupError,
    /// The remote store has no space left
    DriveSizeEmpty,
}

impl NotificationId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationId::IncrementalBackupDown => "incremental_backup_down",
            NotificationId::BackupError => "backup_error",
            NotificationId::DriveSizeEmpty => "drive_size_empty",
        }
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatusState {
    NoBackup,
    Success,
    Fail,
}

/// Badge state persisted under `backup-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub state: BackupStatusState,
    /// `success` or the notification id describing the failure
    pub backup_id: String,
}

impl BackupStatus {
    pub fn success() -> Self {
        Self {
            state: BackupStatusState::Success,
            backup_id: "success".to_string(),
        }
    }

    pub fn failed(id: NotificationId) -> Self {
        Self {
            state: BackupStatusState::Fail,
            backup_id: id.as_str().to_string(),
        }
    }

    pub fn no_backup() -> Self {
        Self {
            state: BackupStatusState::NoBackup,
            backup_id: "no_backup".to_string(),
        }
    }
}
