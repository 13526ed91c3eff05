use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::outbox::{
    AppendEvents, LeaseEvents, NewOutboxRecord, OutboxRecord, WorkerPartition, partition_of,
};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// SQLx-based Postgres outbox driver.
///
/// Appends run inside the caller's transaction. Claims use
/// `FOR UPDATE SKIP LOCKED` plus a `leased_until` column so concurrent
/// workers never hold the same row, and a `partition` column (hash of the
/// partition key) so rows sharing a key are always drained by one worker.
#[derive(Clone)]
pub struct SqlxOutbox {
    pool: sqlx::PgPool,
    partition: WorkerPartition,
    lease: Duration,
}

impl SqlxOutbox {
    /// Creates a new Postgres outbox and ensures the tables exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        create_tables(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Creates a new outbox without bootstrapping the schema.
    pub fn new_uninitialized(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            partition: WorkerPartition::default(),
            lease: DEFAULT_LEASE,
        }
    }

    /// Restrict this handle to the given worker partition slot.
    pub fn with_partition(mut self, partition: WorkerPartition) -> Self {
        self.partition = partition;
        self
    }

    /// Override the claim lease duration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl AppendEvents for SqlxOutbox {
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(queue = queue))]
    async fn append(
        &self,
        queue: &str,
        records: Vec<NewOutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        for record in records {
            let partition = partition_of(&record.stamps);
            let headers = serde_json::to_value(&record.stamps)?;

            sqlx::query(
                "INSERT INTO outbox (queue_name, partition, body, headers, available_at)
                 VALUES ($1, $2, $3, $4, COALESCE($5, now()))",
            )
            .bind(queue)
            .bind(partition)
            .bind(record.body)
            .bind(headers)
            .bind(record.available_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseEvents for SqlxOutbox {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(queue = queue, partition = ?self.partition))]
    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, Self::Error> {
        let lease_until = Utc::now() + self.lease;

        // The NOT EXISTS guard keeps a partition closed while its oldest
        // undelivered row is leased or backing off, so a retried head is
        // never overtaken by later rows of the same partition.
        let rows = sqlx::query(
            "WITH picked AS (
                SELECT outbox_id FROM outbox o
                WHERE queue_name = $1
                  AND delivered_at IS NULL
                  AND available_at <= now()
                  AND (leased_until IS NULL OR leased_until <= now())
                  AND partition % $2 = $3
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox prior
                      WHERE prior.queue_name = o.queue_name
                        AND prior.partition = o.partition
                        AND prior.outbox_id < o.outbox_id
                        AND prior.delivered_at IS NULL
                        AND (prior.available_at > now()
                             OR (prior.leased_until IS NOT NULL AND prior.leased_until > now()))
                  )
                ORDER BY outbox_id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o SET leased_until = $5
            FROM picked
            WHERE o.outbox_id = picked.outbox_id
            RETURNING o.outbox_id, o.queue_name, o.body, o.headers,
                      o.created_at, o.available_at, o.delivered_at, o.attempts",
        )
        .bind(queue)
        .bind(self.partition.total as i32)
        .bind(self.partition.id as i32)
        .bind(limit as i64)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(&row)?);
        }
        // UPDATE ... RETURNING does not guarantee row order.
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), Self::Error> {
        sqlx::query(
            "UPDATE outbox SET delivered_at = now(), leased_until = NULL WHERE outbox_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, id: i64, retry_in: Duration) -> Result<(), Self::Error> {
        sqlx::query(
            "UPDATE outbox
             SET leased_until = NULL, attempts = attempts + 1, available_at = $2
             WHERE outbox_id = $1",
        )
        .bind(id)
        .bind(Utc::now() + retry_in)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unclaim(&self, id: i64) -> Result<(), Self::Error> {
        sqlx::query("UPDATE outbox SET leased_until = NULL WHERE outbox_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, id: i64, reason: &str) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO outbox_dead_letters
                 (outbox_id, queue_name, body, headers, created_at, attempts, reason)
             SELECT outbox_id, queue_name, body, headers, created_at, attempts, $2
             FROM outbox WHERE outbox_id = $1",
        )
        .bind(id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM outbox WHERE outbox_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, Error> {
    let headers: serde_json::Value = row.try_get("headers")?;
    let stamps = serde_json::from_value(headers)?;
    let attempts: i32 = row.try_get("attempts")?;
    let delivered_at: Option<DateTime<Utc>> = row.try_get("delivered_at")?;

    Ok(OutboxRecord {
        id: row.try_get("outbox_id")?,
        queue_name: row.try_get("queue_name")?,
        body: row.try_get("body")?,
        stamps,
        created_at: row.try_get("created_at")?,
        available_at: row.try_get("available_at")?,
        delivered_at,
        attempts: attempts.max(0) as u32,
    })
}

/// Ensures the outbox tables exist.
async fn create_tables(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            outbox_id BIGSERIAL PRIMARY KEY,
            queue_name TEXT NOT NULL,
            partition INT NOT NULL DEFAULT 0,
            body JSONB NOT NULL,
            headers JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            delivered_at TIMESTAMPTZ,
            leased_until TIMESTAMPTZ,
            attempts INT NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS outbox_claim_idx
         ON outbox (queue_name, available_at, outbox_id)
         WHERE delivered_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_dead_letters (
            outbox_id BIGINT PRIMARY KEY,
            queue_name TEXT NOT NULL,
            body JSONB NOT NULL,
            headers JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            attempts INT NOT NULL,
            reason TEXT NOT NULL,
            dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            SqlxDriverErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Serde(err),
        }
    }
}
