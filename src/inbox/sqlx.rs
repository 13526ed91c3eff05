use async_trait::async_trait;

use crate::envelope::{MessageId, MessageName};
use crate::inbox::DedupStore;

/// SQLx-based Postgres deduplication store.
///
/// The `message_id` primary key is the correctness mechanism: the record is
/// inserted with `ON CONFLICT DO NOTHING`, and zero affected rows means the
/// message was already processed. The transaction handed to the business
/// handler is the same one the insert ran in, so both commit atomically.
#[derive(Clone)]
pub struct SqlxDedup {
    pool: sqlx::PgPool,
}

impl SqlxDedup {
    /// Creates a new Postgres dedup store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, sqlx::Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Creates a new store without bootstrapping the schema.
    pub fn new_uninitialized(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for SqlxDedup {
    type Error = sqlx::Error;
    type Transaction = sqlx::Transaction<'static, sqlx::Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        self.pool.begin().await
    }

    #[tracing::instrument(skip_all, fields(message_id = %id))]
    async fn check_and_record(
        &self,
        tx: &mut Self::Transaction,
        id: &MessageId,
        name: &MessageName,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "INSERT INTO inbox_dedup (message_id, message_name)
             VALUES ($1, $2)
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(id.as_uuid())
        .bind(name.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 0)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.commit().await
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.rollback().await
    }
}

/// Ensures the deduplication table exists.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS inbox_dedup (
            message_id UUID PRIMARY KEY,
            message_name TEXT NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}
