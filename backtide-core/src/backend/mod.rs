//! Backup backend capability interface
//!
//! A backend receives hydrated batches from the backup procedure and
//! persists them somewhere off-device. Implementations live in the
//! `backtide-backends` crate and are constructed through a
//! [`BackendRegistry`] keyed by location.

use crate::error::BacktideResult;
use crate::types::{NotificationId, ObjectChange};
use async_trait::async_trait;
use serde_json::Value;

pub mod documents;
pub mod registry;

pub use documents::{document_name, BackupDocuments, ChangeSetDocument, ImageEntry, ImagesDocument};
pub use registry::{BackendContext, BackendFactory, BackendRegistry};

/// Remote collection holding change-set documents
pub const CHANGE_SETS_COLLECTION: &str = "change-sets";
/// Remote collection holding image documents
pub const IMAGES_COLLECTION: &str = "images";

/// One batch handed to [`BackupBackend::backup_changes`]
#[derive(Debug, Clone)]
pub struct BackupBatch {
    pub changes: Vec<ObjectChange>,
    /// Schema version of the local store, in milliseconds
    pub schema_version: i64,
    /// Include blob payloads in an images document
    pub store_blobs: bool,
}

/// Result of a successful [`BackupBackend::backup_changes`] call
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Changes the backend refused; everything else was persisted
    pub rejected: Vec<ObjectChange>,
}

impl BatchOutcome {
    pub fn all_accepted() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait BackupBackend: Send + Sync {
    /// Location key this backend was registered under
    fn backend_type(&self) -> &'static str;

    /// Cheap liveness check; failures map to `false`
    async fn is_reachable(&self) -> bool;

    async fn is_authenticated(&self) -> bool;

    /// Persist a batch. Safe to call again with the same batch.
    async fn backup_changes(&self, batch: BackupBatch) -> BacktideResult<BatchOutcome>;

    /// Names of the documents stored in a remote collection
    async fn list_objects(&self, collection: &str) -> BacktideResult<Vec<String>>;

    async fn retrieve_object(&self, collection: &str, name: &str) -> BacktideResult<Value>;

    /// Browser URL that starts an interactive login, if one is needed
    fn login_url(&self) -> Option<String>;

    /// Consume the URL the login flow redirected back to
    async fn handle_login_redirected_back(&self, location: &str) -> BacktideResult<()>;

    /// Which notification best describes the last failure
    async fn notification_for_failure(&self) -> NotificationId;
}
