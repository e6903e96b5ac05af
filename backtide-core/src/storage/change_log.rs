//! Ordered log of local mutations awaiting backup
//!
//! Entries are keyed by a microsecond timestamp that is unique and strictly
//! increasing in issue order. The backup procedure drains the log in batches
//! up to a cut-off and deletes ("forgets") each batch only after the backend
//! has durably accepted it.

use crate::abstractions::time::Clock;
use crate::error::BacktideResult;
use crate::types::{ChangeLogEntry, ChangeOperation};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const CHANGE_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("change_log");

pub struct ChangeLog {
    database: Arc<Database>,
    clock: Arc<dyn Clock>,
    last_issued: AtomicU64,
    recording: AtomicBool,
}

impl ChangeLog {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> BacktideResult<Self> {
        let database = Arc::new(Database::create(path.as_ref())?);
        Self::new(database, clock)
    }

    pub fn new(database: Arc<Database>, clock: Arc<dyn Clock>) -> BacktideResult<Self> {
        let write_txn = database.begin_write()?;
        let last_key = {
            let table = write_txn.open_table(CHANGE_LOG_TABLE)?;
            let last = table.last()?;
            last.map(|(key, _)| key.value()).unwrap_or(0)
        };
        write_txn.commit()?;

        Ok(Self {
            database,
            clock,
            last_issued: AtomicU64::new(last_key),
            recording: AtomicBool::new(false),
        })
    }

    /// Issue a contiguous range of `count` timestamps and return the first.
    ///
    /// Never returns a value at or below one issued before, even if the
    /// wall clock steps backwards.
    fn reserve(&self, count: u64) -> u64 {
        let count = count.max(1);
        let mut last = self.last_issued.load(Ordering::SeqCst);
        loop {
            let start = self.clock.now_micros().max(last + 1);
            match self.last_issued.compare_exchange(
                last,
                start + count - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return start,
                Err(actual) => last = actual,
            }
        }
    }

    /// Current time on the log's clock. Every entry already recorded is
    /// older than the returned value, every later one is newer.
    pub fn tick(&self) -> u64 {
        self.reserve(1)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn start_recording(&self) {
        if !self.recording.swap(true, Ordering::SeqCst) {
            info!("Started recording changes");
        }
    }

    pub fn stop_recording(&self) {
        if self.recording.swap(false, Ordering::SeqCst) {
            info!("Stopped recording changes");
        }
    }

    /// Append one entry. Returns `None` while recording is disabled.
    pub fn record(
        &self,
        collection: &str,
        object_pk: Value,
        operation: ChangeOperation,
    ) -> BacktideResult<Option<u64>> {
        if !self.is_recording() {
            return Ok(None);
        }

        let entry = ChangeLogEntry {
            timestamp: self.tick(),
            collection: collection.to_string(),
            object_pk,
            operation,
        };
        let bytes = serde_json::to_vec(&entry)?;

        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(CHANGE_LOG_TABLE)?;
            table.insert(entry.timestamp, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(Some(entry.timestamp))
    }

    /// Append many entries in one transaction, regardless of the recording
    /// flag, with consecutive timestamps in iteration order.
    pub fn append_all<I>(&self, changes: I) -> BacktideResult<usize>
    where
        I: IntoIterator<Item = (String, Value, ChangeOperation)>,
    {
        let changes: Vec<_> = changes.into_iter().collect();
        if changes.is_empty() {
            return Ok(0);
        }

        let start = self.reserve(changes.len() as u64);
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(CHANGE_LOG_TABLE)?;
            for (offset, (collection, object_pk, operation)) in changes.iter().enumerate() {
                let entry = ChangeLogEntry {
                    timestamp: start + offset as u64,
                    collection: collection.clone(),
                    object_pk: object_pk.clone(),
                    operation: *operation,
                };
                table.insert(entry.timestamp, serde_json::to_vec(&entry)?.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(changes.len())
    }

    /// Lazily page through entries with `timestamp <= until`, oldest first.
    pub fn stream_changes(self: &Arc<Self>, until: u64, batch_size: usize) -> ChangeStream {
        ChangeStream {
            log: self.clone(),
            until,
            batch_size: batch_size.max(1),
            after: None,
            exhausted: false,
        }
    }

    fn read_page(&self, after: Option<u64>, until: u64, limit: usize) -> BacktideResult<Vec<ChangeLogEntry>> {
        let start = match after {
            Some(ts) if ts >= until => return Ok(Vec::new()),
            Some(ts) => ts + 1,
            None => 0,
        };

        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(CHANGE_LOG_TABLE)?;
        let mut entries = Vec::with_capacity(limit);
        for item in table.range(start..=until)?.take(limit) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    /// Number of entries for `collection` with `timestamp <= until`
    pub fn count_queued_changes(&self, collection: &str, until: u64) -> BacktideResult<u64> {
        Ok(self
            .count_queued_by_collection(until)?
            .get(collection)
            .copied()
            .unwrap_or(0))
    }

    /// Entries with `timestamp <= until` per collection, in one pass
    pub fn count_queued_by_collection(&self, until: u64) -> BacktideResult<HashMap<String, u64>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(CHANGE_LOG_TABLE)?;
        let mut counts = HashMap::new();
        for item in table.range(..=until)? {
            let (_, value) = item?;
            let entry: ChangeLogEntry = serde_json::from_slice(value.value())?;
            *counts.entry(entry.collection).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Total number of entries in the log
    pub fn len(&self) -> BacktideResult<u64> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(CHANGE_LOG_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> BacktideResult<bool> {
        Ok(self.len()? == 0)
    }

    fn forget(&self, timestamps: &[u64]) -> BacktideResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(CHANGE_LOG_TABLE)?;
            for timestamp in timestamps {
                table.remove(*timestamp)?;
            }
        }
        write_txn.commit()?;
        debug!("Forgot {} changes", timestamps.len());
        Ok(())
    }

    /// Empty the log unconditionally
    pub fn forget_all(&self) -> BacktideResult<()> {
        let write_txn = self.database.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(CHANGE_LOG_TABLE)?;
            let keys = table
                .iter()?
                .map(|item| item.map(|(key, _)| key.value()))
                .collect::<Result<Vec<u64>, _>>()?;
            for key in &keys {
                table.remove(*key)?;
            }
            keys.len()
        };
        write_txn.commit()?;
        info!("Cleared change log ({} entries)", removed);
        Ok(())
    }
}

/// Cursor over the log up to a fixed cut-off
///
/// Each call to [`ChangeLog::stream_changes`] starts from the oldest entry.
pub struct ChangeStream {
    log: Arc<ChangeLog>,
    until: u64,
    batch_size: usize,
    after: Option<u64>,
    exhausted: bool,
}

impl ChangeStream {
    /// Next batch, or `None` once the cut-off has been reached
    pub fn next_batch(&mut self) -> BacktideResult<Option<ChangeBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let entries = self.log.read_page(self.after, self.until, self.batch_size)?;
        if entries.len() < self.batch_size {
            self.exhausted = true;
        }
        match entries.last() {
            Some(last) => self.after = Some(last.timestamp),
            None => return Ok(None),
        }

        Ok(Some(ChangeBatch {
            entries,
            log: self.log.clone(),
        }))
    }
}

/// One page of entries yielded by a [`ChangeStream`]
pub struct ChangeBatch {
    entries: Vec<ChangeLogEntry>,
    log: Arc<ChangeLog>,
}

impl ChangeBatch {
    pub fn entries(&self) -> &[ChangeLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete exactly the rows of this batch
    pub fn forget(self) -> BacktideResult<()> {
        let timestamps: Vec<u64> = self.entries.iter().map(|e| e.timestamp).collect();
        self.log.forget(&timestamps)
    }
}
