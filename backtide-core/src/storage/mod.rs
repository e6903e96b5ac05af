//! Local persistence used by the backup engine
//!
//! - [`object_store`]: the redb document store the user's data lives in
//! - [`change_log`]: the ordered log of mutations awaiting backup
//! - [`change_tracker`]: the write hook feeding the change log
//! - [`settings`]: key/value settings and the typed backup-info view

use crate::error::BacktideResult;
use crate::types::{ChangeOperation, CollectionDefinition};
use async_trait::async_trait;
use serde_json::Value;

pub mod change_log;
pub mod change_tracker;
pub mod object_store;
pub mod settings;

pub use change_log::{ChangeBatch, ChangeLog, ChangeStream};
pub use change_tracker::ChangeTracker;
pub use object_store::RedbObjectStore;
pub use settings::{BackupInfoStorage, MemorySettingsStore, RedbSettingsStore, SettingsStore};

/// Delivered to every registered [`StorageHook`] after a write commits
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    pub collection: String,
    pub operation: ChangeOperation,
    pub primary_key: Value,
}

/// Post-commit observer of local store writes
#[async_trait]
pub trait StorageHook: Send + Sync {
    async fn after_write(&self, event: WriteEvent) -> BacktideResult<()>;
}

/// Generic collection/object CRUD the backup engine reads from
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Every registered collection, in registration order
    fn collections(&self) -> Vec<CollectionDefinition>;

    /// Latest collection version, in milliseconds since the epoch
    fn schema_version(&self) -> i64 {
        self.collections()
            .iter()
            .map(|c| c.version.timestamp_millis())
            .max()
            .unwrap_or(0)
    }

    /// Page through a collection in primary-key order
    async fn find_objects(&self, collection: &str, limit: usize, skip: usize)
        -> BacktideResult<Vec<Value>>;

    async fn find_by_pk(&self, collection: &str, pk: &Value) -> BacktideResult<Option<Value>>;

    async fn count_objects(&self, collection: &str) -> BacktideResult<u64>;

    /// Insert a new object and return its primary key
    async fn create_object(&self, collection: &str, object: Value) -> BacktideResult<Value>;

    /// Replace an existing object
    async fn update_object(&self, collection: &str, object: Value) -> BacktideResult<()>;

    /// Delete objects by primary key, returning how many existed
    async fn delete_objects(&self, collection: &str, pks: &[Value]) -> BacktideResult<usize>;
}
