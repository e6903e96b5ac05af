//! Wire documents written by every backend

use super::BackupBatch;
use crate::types::ObjectChange;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetDocument {
    pub version: i64,
    pub changes: Vec<ObjectChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub collection: String,
    pub pk: Value,
    pub field: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesDocument {
    pub version: i64,
    pub images: Vec<ImageEntry>,
}

/// Documents for one batch, sharing a name derived from its newest change
#[derive(Debug, Clone)]
pub struct BackupDocuments {
    pub name: String,
    pub change_set: ChangeSetDocument,
    /// Present only when blobs are stored and the batch carries any
    pub images: Option<ImagesDocument>,
}

/// Zero-padded so lexical order matches timestamp order
pub fn document_name(timestamp: u64) -> String {
    format!("{:020}", timestamp)
}

impl BackupDocuments {
    pub fn prepare(batch: &BackupBatch) -> Self {
        let name = document_name(batch.changes.iter().map(|c| c.timestamp).max().unwrap_or(0));

        let images: Vec<ImageEntry> = if batch.store_blobs {
            batch
                .changes
                .iter()
                .flat_map(|change| {
                    change.blobs.iter().map(move |(field, data)| ImageEntry {
                        collection: change.collection.clone(),
                        pk: change.object_pk.clone(),
                        field: field.clone(),
                        data: data.clone(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            name,
            change_set: ChangeSetDocument {
                version: batch.schema_version,
                changes: batch.changes.clone(),
            },
            images: (!images.is_empty()).then(|| ImagesDocument {
                version: batch.schema_version,
                images,
            }),
        }
    }
}
