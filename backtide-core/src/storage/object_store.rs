//! redb-backed document store
//!
//! One table per collection, keyed by the JSON encoding of the primary key,
//! holding the JSON-encoded object.

use super::{LocalStore, StorageHook, WriteEvent};
use crate::error::{BacktideError, BacktideResult};
use crate::types::{ChangeOperation, CollectionDefinition};
use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

fn table_name(collection: &str) -> String {
    format!("objects/{}", collection)
}

fn encode_pk(pk: &Value) -> BacktideResult<String> {
    Ok(serde_json::to_string(pk)?)
}

pub struct RedbObjectStore {
    database: Arc<Database>,
    collections: Vec<CollectionDefinition>,
    hooks: RwLock<Vec<Arc<dyn StorageHook>>>,
}

impl RedbObjectStore {
    /// Open (or create) the store and make sure every collection table exists
    pub fn open(path: impl AsRef<Path>, collections: Vec<CollectionDefinition>) -> BacktideResult<Self> {
        let database = Arc::new(Database::create(path.as_ref())?);
        Self::new(database, collections)
    }

    pub fn new(database: Arc<Database>, collections: Vec<CollectionDefinition>) -> BacktideResult<Self> {
        let write_txn = database.begin_write()?;
        for collection in &collections {
            let name = table_name(&collection.name);
            write_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;
        }
        write_txn.commit()?;

        Ok(Self {
            database,
            collections,
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Register an observer called after every committed write
    pub fn register_hook(&self, hook: Arc<dyn StorageHook>) {
        self.hooks.write().push(hook);
    }

    fn definition(&self, collection: &str) -> BacktideResult<&CollectionDefinition> {
        self.collections
            .iter()
            .find(|c| c.name == collection)
            .ok_or_else(|| BacktideError::not_found(format!("collection '{}'", collection)))
    }

    fn primary_key(&self, collection: &str, object: &Value) -> BacktideResult<Value> {
        let definition = self.definition(collection)?;
        object
            .get(&definition.pk_field)
            .cloned()
            .ok_or_else(|| {
                BacktideError::validation_error(
                    &definition.pk_field,
                    &format!("object in '{}' has no primary key", collection),
                )
            })
    }

    async fn notify(&self, collection: &str, operation: ChangeOperation, primary_key: Value) -> BacktideResult<()> {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.after_write(WriteEvent {
                collection: collection.to_string(),
                operation,
                primary_key: primary_key.clone(),
            })
            .await?;
        }
        Ok(())
    }

    /// Insert or replace without firing hooks
    fn put(&self, collection: &str, key: &str, object: &Value, must_exist: Option<bool>) -> BacktideResult<()> {
        let name = table_name(collection);
        let bytes = serde_json::to_vec(object)?;

        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;
            let exists = table.get(key)?.is_some();
            match must_exist {
                Some(true) if !exists => {
                    return Err(BacktideError::not_found(format!("{} {}", collection, key)));
                }
                Some(false) if exists => {
                    return Err(BacktideError::invalid_operation(
                        "create_object",
                        format!("{} {} already exists", collection, key),
                    ));
                }
                _ => {}
            }
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for RedbObjectStore {
    fn collections(&self) -> Vec<CollectionDefinition> {
        self.collections.clone()
    }

    async fn find_objects(&self, collection: &str, limit: usize, skip: usize) -> BacktideResult<Vec<Value>> {
        self.definition(collection)?;
        let name = table_name(collection);

        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;

        let mut objects = Vec::with_capacity(limit);
        for item in table.iter()?.skip(skip).take(limit) {
            let (_, value) = item?;
            objects.push(serde_json::from_slice(value.value())?);
        }
        Ok(objects)
    }

    async fn find_by_pk(&self, collection: &str, pk: &Value) -> BacktideResult<Option<Value>> {
        self.definition(collection)?;
        let name = table_name(collection);
        let key = encode_pk(pk)?;

        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn count_objects(&self, collection: &str) -> BacktideResult<u64> {
        self.definition(collection)?;
        let name = table_name(collection);

        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;
        Ok(table.len()?)
    }

    async fn create_object(&self, collection: &str, object: Value) -> BacktideResult<Value> {
        let pk = self.primary_key(collection, &object)?;
        let key = encode_pk(&pk)?;
        self.put(collection, &key, &object, Some(false))?;
        debug!("Created {} {}", collection, key);

        self.notify(collection, ChangeOperation::Create, pk.clone()).await?;
        Ok(pk)
    }

    async fn update_object(&self, collection: &str, object: Value) -> BacktideResult<()> {
        let pk = self.primary_key(collection, &object)?;
        let key = encode_pk(&pk)?;
        self.put(collection, &key, &object, Some(true))?;
        debug!("Updated {} {}", collection, key);

        self.notify(collection, ChangeOperation::Update, pk).await
    }

    async fn delete_objects(&self, collection: &str, pks: &[Value]) -> BacktideResult<usize> {
        self.definition(collection)?;
        let name = table_name(collection);

        let mut deleted = Vec::new();
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(TableDefinition::<&str, &[u8]>::new(&name))?;
            for pk in pks {
                let key = encode_pk(pk)?;
                if table.remove(key.as_str())?.is_some() {
                    deleted.push(pk.clone());
                }
            }
        }
        write_txn.commit()?;
        debug!("Deleted {} objects from {}", deleted.len(), collection);

        let count = deleted.len();
        for pk in deleted {
            self.notify(collection, ChangeOperation::Delete, pk).await?;
        }
        Ok(count)
    }
}
