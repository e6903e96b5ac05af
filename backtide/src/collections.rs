//! Collections tracked by the daemon

use backtide_core::abstractions::micros_to_datetime;
use backtide_core::error::{BacktideError, BacktideResult};
use backtide_core::types::CollectionDefinition;
use std::path::Path;
use tracing::info;

/// 2024-01-01T00:00:00Z
const BASE_SCHEMA_MICROS: u64 = 1_704_067_200_000_000;

/// Knowledge-base collections shipped with the daemon
pub fn default_collections() -> Vec<CollectionDefinition> {
    let version = micros_to_datetime(BASE_SCHEMA_MICROS);
    vec![
        CollectionDefinition::new("pages", "url", version).with_blob_fields(["screenshot"]),
        CollectionDefinition::new("visits", "id", version),
        CollectionDefinition::new("bookmarks", "url", version),
        CollectionDefinition::new("tags", "id", version),
        CollectionDefinition::new("annotations", "url", version),
        CollectionDefinition::new("customLists", "id", version),
        CollectionDefinition::new("pageListEntries", "id", version),
        CollectionDefinition::new("favIcons", "hostname", version).with_blob_fields(["favIcon"]),
        CollectionDefinition::new("backupChanges", "timestamp", version).excluded(),
    ]
}

/// Read collection definitions from a JSON array, or fall back to the defaults
pub fn load_collections(path: Option<&Path>) -> BacktideResult<Vec<CollectionDefinition>> {
    let Some(path) = path else {
        return Ok(default_collections());
    };

    let raw = std::fs::read_to_string(path)?;
    let collections: Vec<CollectionDefinition> = serde_json::from_str(&raw)?;
    if collections.is_empty() {
        return Err(BacktideError::configuration(
            "collections",
            format!("{} defines no collections", path.display()),
        ));
    }
    info!("Loaded {} collection definitions from {}", collections.len(), path.display());
    Ok(collections)
}
