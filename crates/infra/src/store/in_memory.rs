use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::capped::{CappedStore, NewRecord, RecordFilter, StoreError, StoredRecord};

#[derive(Debug, Default)]
struct Collection {
    max_records: Option<usize>,
    records: VecDeque<StoredRecord>,
    last_position: u64,
}

/// In-memory capped store.
///
/// Intended for tests/dev and for several command services sharing one process.
/// Tail waiters are woken on every append.
#[derive(Debug, Default)]
pub struct InMemoryCappedStore {
    collection: Mutex<Collection>,
    appended: Notify,
}

impl InMemoryCappedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.collection.lock().map(|c| c.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every held record, oldest first.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.collection
            .lock()
            .map(|c| c.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn collect_after(&self, channel: &str, position: u64) -> Result<Vec<StoredRecord>, StoreError> {
        let collection = self
            .collection
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        if collection.max_records.is_none() {
            return Err(StoreError::NotCapped);
        }

        Ok(collection
            .records
            .iter()
            .filter(|r| r.position > position && r.channel == channel)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CappedStore for InMemoryCappedStore {
    async fn ensure_capped(&self, max_records: usize) -> Result<bool, StoreError> {
        let mut collection = self
            .collection
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        if collection.max_records.is_some() {
            return Ok(false);
        }
        collection.max_records = Some(max_records.max(1));
        Ok(true)
    }

    async fn append(&self, record: NewRecord) -> Result<u64, StoreError> {
        let position = {
            let mut collection = self
                .collection
                .lock()
                .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

            let Some(max_records) = collection.max_records else {
                return Err(StoreError::NotCapped);
            };

            collection.last_position += 1;
            let position = collection.last_position;
            collection.records.push_back(StoredRecord {
                position,
                channel: record.channel,
                primer: record.primer,
                body: record.body,
                inserted_at: Utc::now(),
            });

            while collection.records.len() > max_records {
                collection.records.pop_front();
            }
            position
        };

        self.appended.notify_waiters();
        Ok(position)
    }

    async fn latest_position(&self) -> Result<Option<u64>, StoreError> {
        let collection = self
            .collection
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        if collection.max_records.is_none() {
            return Err(StoreError::NotCapped);
        }
        Ok(collection.records.back().map(|r| r.position))
    }

    async fn read_after(
        &self,
        channel: &str,
        position: u64,
        wait: Duration,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = self.collect_after(channel, position)?;
            if !found.is_empty() {
                return Ok(found);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut collection = self
            .collection
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        let before = collection.records.len();
        collection.records.retain(|r| !filter.matches(r));
        Ok((before - collection.records.len()) as u64)
    }
}
