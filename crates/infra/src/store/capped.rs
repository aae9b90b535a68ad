use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A record ready to be appended (not yet assigned a position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub channel: String,

    /// Primer records only exist so a tail never starts against an empty store.
    pub primer: bool,

    pub body: JsonValue,
}

impl NewRecord {
    pub fn new(channel: impl Into<String>, body: JsonValue) -> Self {
        Self {
            channel: channel.into(),
            primer: false,
            body,
        }
    }

    pub fn primer() -> Self {
        Self {
            channel: String::new(),
            primer: true,
            body: serde_json::json!({ "primer": true }),
        }
    }
}

/// A stored record (assigned a position).
///
/// Positions are assigned by the store on append and are strictly increasing in
/// insertion order across the whole store, not per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub position: u64,
    pub channel: String,
    pub primer: bool,
    pub body: JsonValue,
    pub inserted_at: DateTime<Utc>,
}

/// Criteria for `delete_matching`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub channel: Option<String>,
    pub primer: Option<bool>,
    /// Match records with a position strictly below this one.
    pub before_position: Option<u64>,
}

impl RecordFilter {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn primers() -> Self {
        Self {
            primer: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.channel.as_ref().is_none_or(|c| *c == record.channel)
            && self.primer.is_none_or(|p| p == record.primer)
            && self.before_position.is_none_or(|p| record.position < p)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The collection has not been created as a capped collection yet.
    #[error("capped collection does not exist")]
    NotCapped,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Bounded, insert-only, pollable store.
///
/// This is the whole persistence surface the tailing broker consumes: append, tail
/// records after a position, and delete matching records.
///
/// ## Capping
///
/// Once `ensure_capped(max_records)` has run, the store keeps at most `max_records`
/// records and evicts the oldest on append.
///
/// ## Tailing
///
/// `read_after` returns records of one channel positioned after `position`, waiting up
/// to `wait` for at least one to appear. An empty result after the wait is normal and
/// means "nothing new yet".
#[async_trait]
pub trait CappedStore: Send + Sync {
    /// Create the capped collection if absent. Returns `true` if it was created.
    async fn ensure_capped(&self, max_records: usize) -> Result<bool, StoreError>;

    /// Append a record and return its position.
    async fn append(&self, record: NewRecord) -> Result<u64, StoreError>;

    /// Position of the most recently appended record, across all channels.
    async fn latest_position(&self) -> Result<Option<u64>, StoreError>;

    async fn read_after(
        &self,
        channel: &str,
        position: u64,
        wait: Duration,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Delete all records matching `filter`. Returns the number deleted.
    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> CappedStore for Arc<S>
where
    S: CappedStore + ?Sized,
{
    async fn ensure_capped(&self, max_records: usize) -> Result<bool, StoreError> {
        (**self).ensure_capped(max_records).await
    }

    async fn append(&self, record: NewRecord) -> Result<u64, StoreError> {
        (**self).append(record).await
    }

    async fn latest_position(&self) -> Result<Option<u64>, StoreError> {
        (**self).latest_position().await
    }

    async fn read_after(
        &self,
        channel: &str,
        position: u64,
        wait: Duration,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        (**self).read_after(channel, position, wait).await
    }

    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        (**self).delete_matching(filter).await
    }
}
