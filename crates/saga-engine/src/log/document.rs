//! Document-store saga log: one row per saga, `messages` a growing JSONB
//! array, appended atomically. Reference implementation against
//! PostgreSQL, gated behind the `postgres` feature.

use super::{already_running, not_running, SagaLog, SagaRecord, SagaTransaction};
use crate::error::{Result, SagaEngineError};
use crate::message::SagaMessage;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};

/// A saga log backed by a single Postgres table, one document (row) per
/// saga. The `messages` column is a JSONB array; appends push onto it
/// and bump `updated_at` in the same statement, so a single append is
/// atomic without needing an explicit transaction.
#[derive(Debug, Clone)]
pub struct DocumentSagaLog {
    pool: PgPool,
}

impl DocumentSagaLog {
    /// Connects to `database_url` with a small default pool.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(SagaEngineError::storage)?;

        Ok(Self { pool })
    }

    /// Wraps an already-constructed pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `sagas` table and its indices if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagas (
                saga_id TEXT PRIMARY KEY,
                messages JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                parent_saga_id TEXT,
                parent_task_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sagas_parent_saga_id ON sagas(parent_saga_id);
            CREATE INDEX IF NOT EXISTS idx_sagas_updated_at ON sagas(updated_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(SagaEngineError::storage)?;

        Ok(())
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SagaLog for DocumentSagaLog {
    async fn start_saga_with_message(&self, msg: SagaMessage) -> Result<()> {
        let record = SagaRecord::new(msg);
        let messages = serde_json::to_value(&record.messages)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sagas (saga_id, messages, created_at, updated_at, parent_saga_id, parent_task_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.saga_id)
        .bind(messages)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.parent_saga_id)
        .bind(&record.parent_task_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(already_running(&record.saga_id))
            }
            Err(e) => Err(SagaEngineError::storage(e)),
        }
    }

    async fn log_message(&self, msg: SagaMessage) -> Result<()> {
        let message_json = serde_json::to_value(std::slice::from_ref(&msg))?;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET messages = messages || $1::jsonb, updated_at = $2
            WHERE saga_id = $3
            "#,
        )
        .bind(message_json)
        .bind(msg.timestamp)
        .bind(&msg.saga_id)
        .execute(&self.pool)
        .await
        .map_err(SagaEngineError::storage)?;

        if result.rows_affected() == 0 {
            return Err(not_running(&msg.saga_id));
        }
        Ok(())
    }

    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>> {
        let row = sqlx::query("SELECT messages FROM sagas WHERE saga_id = $1")
            .bind(saga_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SagaEngineError::storage)?
            .ok_or_else(|| not_running(saga_id))?;

        let messages: serde_json::Value = row.get("messages");
        Ok(serde_json::from_value(messages)?)
    }

    async fn get_active_saga_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT saga_id FROM sagas")
            .fetch_all(&self.pool)
            .await
            .map_err(SagaEngineError::storage)?;

        Ok(rows.iter().map(|row| row.get("saga_id")).collect())
    }

    async fn get_child_saga_ids(&self, parent_saga_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT saga_id FROM sagas WHERE parent_saga_id = $1")
            .bind(parent_saga_id)
            .fetch_all(&self.pool)
            .await
            .map_err(SagaEngineError::storage)?;

        Ok(rows.iter().map(|row| row.get("saga_id")).collect())
    }

    async fn delete_saga(&self, saga_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sagas WHERE saga_id = $1")
            .bind(saga_id)
            .execute(&self.pool)
            .await
            .map_err(SagaEngineError::storage)?;

        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin_transaction(&self) -> Result<SagaTransaction> {
        let tx: Transaction<'static, Postgres> =
            self.pool.begin().await.map_err(SagaEngineError::storage)?;
        Ok(Box::new(tx))
    }

    async fn commit_transaction(&self, tx: SagaTransaction) -> Result<()> {
        let tx = *tx
            .downcast::<Transaction<'static, Postgres>>()
            .map_err(|_| SagaEngineError::storage("foreign transaction handle"))?;
        tx.commit().await.map_err(SagaEngineError::storage)
    }

    async fn abort_transaction(&self, tx: SagaTransaction) -> Result<()> {
        let tx = *tx
            .downcast::<Transaction<'static, Postgres>>()
            .map_err(|_| SagaEngineError::storage("foreign transaction handle"))?;
        tx.rollback().await.map_err(SagaEngineError::storage)
    }

    async fn log_message_in_transaction(&self, tx: &mut SagaTransaction, msg: SagaMessage) -> Result<()> {
        let pg_tx = tx
            .downcast_mut::<Transaction<'static, Postgres>>()
            .ok_or_else(|| SagaEngineError::storage("foreign transaction handle"))?;
        let message_json = serde_json::to_value(std::slice::from_ref(&msg))?;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET messages = messages || $1::jsonb, updated_at = $2
            WHERE saga_id = $3
            "#,
        )
        .bind(message_json)
        .bind(msg.timestamp)
        .bind(&msg.saga_id)
        .execute(&mut *pg_tx)
        .await
        .map_err(SagaEngineError::storage)?;

        if result.rows_affected() == 0 {
            return Err(not_running(&msg.saga_id));
        }
        Ok(())
    }

    async fn delete_saga_in_transaction(&self, tx: &mut SagaTransaction, saga_id: &str) -> Result<()> {
        let pg_tx = tx
            .downcast_mut::<Transaction<'static, Postgres>>()
            .ok_or_else(|| SagaEngineError::storage("foreign transaction handle"))?;

        sqlx::query("DELETE FROM sagas WHERE saga_id = $1")
            .bind(saga_id)
            .execute(&mut *pg_tx)
            .await
            .map_err(SagaEngineError::storage)?;

        Ok(())
    }
}
