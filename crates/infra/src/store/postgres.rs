//! Postgres-backed capped store.
//!
//! Records live in a single `command_queue` table keyed by a `BIGSERIAL` position.
//! Postgres has no native capped tables, so the cap is enforced on append by deleting
//! rows that fall more than `max_records` positions behind the newest one.
//!
//! Appends run one at a time under a transaction-scoped advisory lock, which keeps
//! commit order equal to position order for tailing readers.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | PoolClosed, Io, PoolTimedOut | `Unavailable` (connection-level, worth a reconnect) |
//! | anything else | `Storage` |

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::capped::{CappedStore, NewRecord, RecordFilter, StoreError, StoredRecord};

/// Upper bound on records returned by one `read_after` call.
const READ_BATCH: i64 = 100;

/// Advisory lock serialising appends. A `BIGSERIAL` value is taken at insert time but
/// only seen at commit, so without it a tail could move past a position whose row
/// commits later.
const APPEND_LOCK_KEY: i64 = 0x636d_6471; // "cmdq"

/// How often `read_after` re-polls while waiting for new rows.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PostgresCappedStore {
    pool: Arc<PgPool>,
    max_records: Arc<AtomicUsize>,
    poll_interval: Duration,
}

impl PostgresCappedStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            max_records: Arc::new(AtomicUsize::new(0)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn cap(&self) -> Result<usize, StoreError> {
        match self.max_records.load(Ordering::SeqCst) {
            0 => Err(StoreError::NotCapped),
            n => Ok(n),
        }
    }

    async fn fetch_after(&self, channel: &str, position: u64) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, channel, primer, body, inserted_at
            FROM command_queue
            WHERE channel = $1 AND position > $2
            ORDER BY position ASC
            LIMIT $3
            "#,
        )
        .bind(channel)
        .bind(to_db_position(position))
        .bind(READ_BATCH)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_after", e))?;

        rows.iter()
            .map(|row| {
                let position: i64 = row.try_get("position").map_err(|e| map_sqlx_error("read_after", e))?;
                let body: Json<JsonValue> = row.try_get("body").map_err(|e| map_sqlx_error("read_after", e))?;
                let inserted_at: DateTime<Utc> =
                    row.try_get("inserted_at").map_err(|e| map_sqlx_error("read_after", e))?;
                Ok(StoredRecord {
                    position: position as u64,
                    channel: row.try_get("channel").map_err(|e| map_sqlx_error("read_after", e))?,
                    primer: row.try_get("primer").map_err(|e| map_sqlx_error("read_after", e))?,
                    body: body.0,
                    inserted_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CappedStore for PostgresCappedStore {
    #[instrument(skip(self), err)]
    async fn ensure_capped(&self, max_records: usize) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass('command_queue') IS NOT NULL")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_capped", e))?;

        if !exists {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS command_queue (
                    position BIGSERIAL PRIMARY KEY,
                    channel TEXT NOT NULL,
                    primer BOOLEAN NOT NULL DEFAULT FALSE,
                    body JSONB NOT NULL,
                    inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_capped", e))?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS command_queue_channel_position ON command_queue (channel, position)",
            )
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_capped", e))?;
        }

        self.max_records.store(max_records.max(1), Ordering::SeqCst);
        Ok(!exists)
    }

    #[instrument(skip(self, record), fields(channel = %record.channel), err)]
    async fn append(&self, record: NewRecord) -> Result<u64, StoreError> {
        let cap = self.cap()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Held until commit, so positions become visible in allocation order.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_lock", e))?;

        let position: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO command_queue (channel, primer, body)
            VALUES ($1, $2, $3)
            RETURNING position
            "#,
        )
        .bind(&record.channel)
        .bind(record.primer)
        .bind(Json(&record.body))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        let trimmed = sqlx::query("DELETE FROM command_queue WHERE position <= $1")
            .bind(position - cap as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append", e))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if trimmed > 0 {
            debug!(trimmed, "evicted records beyond cap");
        }

        Ok(position as u64)
    }

    async fn latest_position(&self) -> Result<Option<u64>, StoreError> {
        self.cap()?;

        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(position) FROM command_queue")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_position", e))?;

        Ok(latest.map(|p| p as u64))
    }

    async fn read_after(
        &self,
        channel: &str,
        position: u64,
        wait: Duration,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        self.cap()?;
        let deadline = Instant::now() + wait;

        loop {
            let found = self.fetch_after(channel, position).await?;
            if !found.is_empty() {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self), err)]
    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM command_queue
            WHERE ($1::TEXT IS NULL OR channel = $1)
              AND ($2::BOOLEAN IS NULL OR primer = $2)
              AND ($3::BIGINT IS NULL OR position < $3)
            "#,
        )
        .bind(filter.channel.as_deref())
        .bind(filter.primer)
        .bind(filter.before_position.map(to_db_position))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_matching", e))?
        .rows_affected();

        Ok(deleted)
    }
}

fn to_db_position(position: u64) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
