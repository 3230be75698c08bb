use crate::repository::{ClaimedBatch, MessageOutcome, OutboxRepository};
use ar_common::{OutboxMessage, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL outbox store.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED`, which lets concurrent dispatcher
/// replicas each grab a disjoint subset of pending rows with no external
/// lock service. The claim transaction stays open until the batch completes;
/// dropping the batch rolls it back and the rows become visible again.
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                id UUID PRIMARY KEY,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_pending
                ON outbox_messages (occurred_at)
                WHERE processed_at IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> OutboxMessage {
    OutboxMessage {
        id: row.get("id"),
        event_type: row.get("type"),
        content: row.get("content"),
        occurred_at: row.get("occurred_at"),
        processed_at: row.get("processed_at"),
        error: row.get("error"),
        attempt_count: row.get("attempt_count"),
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn claim(&self, batch_size: u32, max_attempts: i32) -> Result<Box<dyn ClaimedBatch>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, type, content, occurred_at, processed_at, error, attempt_count
            FROM outbox_messages
            WHERE processed_at IS NULL AND attempt_count < $1
            ORDER BY occurred_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(max_attempts)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await?;

        let messages = rows.iter().map(message_from_row).collect();

        Ok(Box::new(PgClaimedBatch { tx, messages }))
    }

    async fn delete_delivered_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_messages
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE processed_at IS NOT NULL
                  AND error IS NULL
                  AND occurred_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

struct PgClaimedBatch {
    tx: Transaction<'static, Postgres>,
    messages: Vec<OutboxMessage>,
}

#[async_trait]
impl ClaimedBatch for PgClaimedBatch {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    async fn complete(mut self: Box<Self>, outcomes: Vec<MessageOutcome>) -> Result<()> {
        if !outcomes.is_empty() {
            let ids: Vec<Uuid> = outcomes.iter().map(|o| o.id).collect();
            let processed: Vec<Option<DateTime<Utc>>> =
                outcomes.iter().map(|o| o.processed_at).collect();
            let errors: Vec<Option<String>> = outcomes.iter().map(|o| o.error.clone()).collect();
            let deltas: Vec<i32> = outcomes.iter().map(|o| o.attempt_delta).collect();

            sqlx::query(
                r#"
                UPDATE outbox_messages AS m
                SET processed_at = u.processed_at,
                    error = u.error,
                    attempt_count = m.attempt_count + u.attempt_delta
                FROM UNNEST($1::uuid[], $2::timestamptz[], $3::text[], $4::int[])
                    AS u(id, processed_at, error, attempt_delta)
                WHERE m.id = u.id
                "#,
            )
            .bind(&ids)
            .bind(&processed)
            .bind(&errors)
            .bind(&deltas)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }
}
