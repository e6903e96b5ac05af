use super::{ChangeLog, StorageHook, WriteEvent};
use crate::error::BacktideResult;
use crate::types::CollectionDefinition;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Storage hook forwarding writes on backed-up collections to the change log
pub struct ChangeTracker {
    change_log: Arc<ChangeLog>,
    excluded: HashSet<String>,
}

impl ChangeTracker {
    pub fn new(change_log: Arc<ChangeLog>, collections: &[CollectionDefinition]) -> Self {
        let excluded = collections
            .iter()
            .filter(|c| c.excluded_from_backup)
            .map(|c| c.name.clone())
            .collect();
        Self {
            change_log,
            excluded,
        }
    }
}

#[async_trait]
impl StorageHook for ChangeTracker {
    async fn after_write(&self, event: WriteEvent) -> BacktideResult<()> {
        if self.excluded.contains(&event.collection) {
            return Ok(());
        }
        self.change_log
            .record(&event.collection, event.primary_key, event.operation)?;
        Ok(())
    }
}
