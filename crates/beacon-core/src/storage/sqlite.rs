//! SQLite-backed queue store.
//!
//! Schema:
//!
//! - `destinations`: one row per `(endpoint, access_token)` pair.
//! - `payloads`: queued documents in insertion order, cascading on
//!   destination delete.
//! - `dead_letters`: payloads that exhausted their attempts under the
//!   dead-letter policy.

use std::{path::Path, str::FromStr, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{QueueStore, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{DeadLetter, Destination, PayloadId, QueuedPayload},
};

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type PayloadRow = (String, i64, String, i64);
type DeadLetterRow = (String, i64, String, i64, String, i64);

/// Queue store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    /// Opens (or creates) the database file at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!(path = %path.as_ref().display(), "opened sqlite queue store");
        Self::with_pool(pool).await
    }

    /// Creates a private in-memory database.
    ///
    /// The pool is pinned to a single connection that never expires, because
    /// every SQLite memory connection sees its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wraps an existing pool and applies the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Deletes a destination; its queued and dead-lettered payloads cascade.
    ///
    /// Returns the number of queued payloads that were discarded.
    pub async fn purge_destination(&self, destination: &Destination) -> Result<usize> {
        let queued = self.count_for(destination).await?;
        sqlx::query("DELETE FROM destinations WHERE endpoint = ? AND access_token = ?")
            .bind(&destination.endpoint)
            .bind(destination.access_token.expose())
            .execute(&self.pool)
            .await?;
        Ok(queued)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY NOT NULL,
                endpoint TEXT NOT NULL,
                access_token TEXT NOT NULL,
                UNIQUE (endpoint, access_token)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS payloads (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                destination_id TEXT NOT NULL
                    REFERENCES destinations (id) ON DELETE CASCADE
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_payloads_destination ON payloads (destination_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dead_letters (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                failed_at INTEGER NOT NULL,
                destination_id TEXT NOT NULL
                    REFERENCES destinations (id) ON DELETE CASCADE
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        debug!("sqlite queue schema ready");
        Ok(())
    }

    async fn count_for(&self, destination: &Destination) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM payloads p
            JOIN destinations d ON d.id = p.destination_id
            WHERE d.endpoint = ? AND d.access_token = ?
            ",
        )
        .bind(&destination.endpoint)
        .bind(destination.access_token.expose())
        .fetch_one(&self.pool)
        .await?;
        Ok(to_usize(count))
    }
}

impl QueueStore for SqliteQueueStore {
    fn enqueue(&self, payload: QueuedPayload) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let body = serde_json::to_string(&payload.body)?;
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r"
                INSERT INTO destinations (id, endpoint, access_token) VALUES (?, ?, ?)
                ON CONFLICT (endpoint, access_token) DO NOTHING
                ",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&payload.destination.endpoint)
            .bind(payload.destination.access_token.expose())
            .execute(&mut *tx)
            .await?;

            let destination_id: String = sqlx::query_scalar(
                "SELECT id FROM destinations WHERE endpoint = ? AND access_token = ?",
            )
            .bind(&payload.destination.endpoint)
            .bind(payload.destination.access_token.expose())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r"
                INSERT INTO payloads (id, timestamp, payload_json, attempt_count, destination_id)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(payload.id.to_string())
            .bind(payload.timestamp)
            .bind(body)
            .bind(i64::from(payload.attempt_count))
            .bind(destination_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
    }

    fn peek_oldest<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> StoreFuture<'a, Option<QueuedPayload>> {
        Box::pin(async move {
            let row: Option<PayloadRow> = sqlx::query_as(
                r"
                SELECT p.id, p.timestamp, p.payload_json, p.attempt_count FROM payloads p
                JOIN destinations d ON d.id = p.destination_id
                WHERE d.endpoint = ? AND d.access_token = ?
                ORDER BY p.seq
                LIMIT 1
                ",
            )
            .bind(&destination.endpoint)
            .bind(destination.access_token.expose())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let key = row.0.clone();
            payload_from_row(row, destination.clone())
                .map(Some)
                .map_err(|e| CoreError::corrupt_payload(key, e))
        })
    }

    fn remove(&self, id: PayloadId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM payloads WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn count_by_destination<'a>(&'a self, destination: &'a Destination) -> StoreFuture<'a, usize> {
        Box::pin(self.count_for(destination))
    }

    fn total_count(&self) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM payloads").fetch_one(&self.pool).await?;
            Ok(to_usize(count))
        })
    }

    fn record_attempt(&self, id: PayloadId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let count: Option<i64> = sqlx::query_scalar(
                "UPDATE payloads SET attempt_count = attempt_count + 1 WHERE id = ? \
                 RETURNING attempt_count",
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

            let count = count.ok_or(CoreError::PayloadNotFound(id))?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    fn contains(&self, id: PayloadId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let exists: i64 =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payloads WHERE id = ?)")
                    .bind(id.to_string())
                    .fetch_one(&self.pool)
                    .await?;
            Ok(exists != 0)
        })
    }

    fn destinations(&self) -> StoreFuture<'_, Vec<Destination>> {
        Box::pin(async move {
            let rows: Vec<(String, String)> = sqlx::query_as(
                r"
                SELECT d.endpoint, d.access_token FROM destinations d
                WHERE EXISTS (SELECT 1 FROM payloads p WHERE p.destination_id = d.id)
                ORDER BY d.endpoint, d.access_token
                ",
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(endpoint, token)| Destination::new(endpoint, token))
                .collect::<Vec<_>>())
        })
    }

    fn dead_letter(&self, id: PayloadId, reason: String, failed_at: i64) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let moved = sqlx::query(
                r"
                INSERT INTO dead_letters
                    (id, timestamp, payload_json, attempt_count, reason, failed_at, destination_id)
                SELECT id, timestamp, payload_json, attempt_count, ?, ?, destination_id
                FROM payloads WHERE id = ?
                ",
            )
            .bind(reason)
            .bind(failed_at)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM payloads WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(moved.rows_affected() > 0)
        })
    }

    fn remove_corrupt<'a>(
        &'a self,
        destination: &'a Destination,
        key: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM payloads WHERE id = ? AND destination_id IN (
                    SELECT id FROM destinations WHERE endpoint = ? AND access_token = ?
                )
                ",
            )
            .bind(key)
            .bind(&destination.endpoint)
            .bind(destination.access_token.expose())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                warn!(key, endpoint = %destination.endpoint, "removed undecodable payload row");
            }
            Ok(result.rows_affected() > 0)
        })
    }

    fn dead_letters<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> StoreFuture<'a, Vec<DeadLetter>> {
        Box::pin(async move {
            let rows: Vec<DeadLetterRow> = sqlx::query_as(
                r"
                SELECT l.id, l.timestamp, l.payload_json, l.attempt_count, l.reason, l.failed_at
                FROM dead_letters l
                JOIN destinations d ON d.id = l.destination_id
                WHERE d.endpoint = ? AND d.access_token = ?
                ORDER BY l.seq
                ",
            )
            .bind(&destination.endpoint)
            .bind(destination.access_token.expose())
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(id, timestamp, json, attempts, reason, failed_at)| {
                    let payload =
                        payload_from_row((id, timestamp, json, attempts), destination.clone())?;
                    Ok(DeadLetter { payload, reason, failed_at })
                })
                .collect::<Result<Vec<_>>>()
        })
    }
}

fn payload_from_row(row: PayloadRow, destination: Destination) -> Result<QueuedPayload> {
    let (id, timestamp, json, attempt_count) = row;
    Ok(QueuedPayload {
        id: id.parse()?,
        timestamp,
        destination,
        body: serde_json::from_str(&json)?,
        attempt_count: u32::try_from(attempt_count).map_err(|_| {
            CoreError::Serialization(format!("attempt count out of range: {attempt_count}"))
        })?,
    })
}

fn to_usize(count: i64) -> usize {
    usize::try_from(count).unwrap_or_default()
}
