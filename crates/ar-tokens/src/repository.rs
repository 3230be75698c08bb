//! PostgreSQL persistence for refresh tokens.
//!
//! Every mutating helper takes the caller's open transaction so the token
//! rows and the outbox rows staged from their event buffers commit
//! atomically. Token reads take row locks (`FOR UPDATE`) to serialize
//! concurrent presentations of the same token.

use crate::domain::{RefreshToken, TokenStatus};
use ar_common::{AuthRelayError, Result};
use ar_outbox::capture;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

pub struct PgRefreshTokenRepository {
    pool: PgPool,
}

impl PgRefreshTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id UUID PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                expires_at TIMESTAMPTZ NOT NULL,
                user_id UUID NOT NULL,
                device_id TEXT NOT NULL,
                status TEXT NOT NULL,
                revoked_at TIMESTAMPTZ,
                replaced_by_id UUID UNIQUE REFERENCES refresh_tokens(id),
                created_at TIMESTAMPTZ NOT NULL,
                modified_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user_active
                ON refresh_tokens (user_id)
                WHERE status = 'ACTIVE'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn token_from_row(row: &PgRow) -> Result<RefreshToken> {
    let status_raw: String = row.get("status");
    let status = TokenStatus::parse(&status_raw).ok_or_else(|| {
        AuthRelayError::Database(sqlx::Error::Decode(
            format!("unknown token status: {status_raw}").into(),
        ))
    })?;

    Ok(RefreshToken {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        user_id: row.get("user_id"),
        device_id: row.get("device_id"),
        status,
        revoked_at: row.get("revoked_at"),
        replaced_by_id: row.get("replaced_by_id"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
        events: Vec::new(),
    })
}

/// Load and row-lock the token with this secret hash.
pub async fn find_by_hash(
    tx: &mut Transaction<'_, Postgres>,
    token_hash: &str,
) -> Result<Option<RefreshToken>> {
    let row = sqlx::query(
        r#"
        SELECT id, token_hash, expires_at, user_id, device_id, status,
               revoked_at, replaced_by_id, created_at, modified_at
        FROM refresh_tokens
        WHERE token_hash = $1
        FOR UPDATE
        "#,
    )
    .bind(token_hash)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(token_from_row).transpose()
}

/// Load and row-lock every other still-`Active` token of the user, for
/// chain revocation. Locks are taken in id order so two concurrent sweeps
/// over the same user cannot deadlock each other.
pub async fn find_active_for_user(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    excluding: Uuid,
) -> Result<Vec<RefreshToken>> {
    let rows = sqlx::query(
        r#"
        SELECT id, token_hash, expires_at, user_id, device_id, status,
               revoked_at, replaced_by_id, created_at, modified_at
        FROM refresh_tokens
        WHERE user_id = $1 AND status = 'ACTIVE' AND id <> $2
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(excluding)
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(token_from_row).collect()
}

/// Upsert the token row and capture its buffered events as outbox rows in
/// the same transaction. This is the unit-of-work save: state change and
/// event rows commit or roll back together.
///
/// Identity fields are immutable after creation; only the transition
/// columns are updated on conflict.
pub async fn persist(
    tx: &mut Transaction<'_, Postgres>,
    token: &mut RefreshToken,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens
            (id, token_hash, expires_at, user_id, device_id, status,
             revoked_at, replaced_by_id, created_at, modified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            revoked_at = EXCLUDED.revoked_at,
            replaced_by_id = EXCLUDED.replaced_by_id,
            modified_at = EXCLUDED.modified_at
        "#,
    )
    .bind(token.id)
    .bind(&token.token_hash)
    .bind(token.expires_at)
    .bind(token.user_id)
    .bind(&token.device_id)
    .bind(token.status.as_str())
    .bind(token.revoked_at)
    .bind(token.replaced_by_id)
    .bind(token.created_at)
    .bind(token.modified_at)
    .execute(&mut **tx)
    .await?;

    capture::capture_events(tx, token).await?;
    Ok(())
}
