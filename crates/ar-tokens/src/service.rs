//! Refresh-token service.
//!
//! Implements the login-with-refresh-token validation flow. The rule order
//! is load-bearing: a replayed, already-rotated token must be flagged as a
//! breach (rule 2) even though it would also fail the expiry and device
//! checks, because reuse is the most severe signal and must not be masked
//! by a less alarming classification.

use crate::domain::RefreshToken;
use crate::repository;
use ar_common::{Result, TokenConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Access-token issuance, consumed as a black box (JWT signing lives
/// elsewhere).
#[async_trait]
pub trait AccessTokenIssuer: Send + Sync {
    async fn issue(&self, user_id: Uuid) -> Result<String>;
}

/// A fresh access/refresh pair. `refresh_token` is the raw secret; only
/// its hash is stored.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub user_id: Uuid,
}

/// Typed outcome of a refresh attempt. The denial variants exist for the
/// audit trail; user-visible responses collapse them via
/// [`RefreshOutcome::into_client_result`].
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Token hash not found.
    Invalid,
    /// Reuse of a non-active token; the user's chain was compromised.
    Revoked,
    /// Presented after expiry; the token was revoked.
    Expired,
    /// Presented from the wrong device; the token was compromised.
    InvalidDevice,
    Refreshed(IssuedTokens),
}

/// The one generic denial shown to callers, so the response does not leak
/// which rule triggered.
#[derive(Debug, thiserror::Error)]
#[error("invalid refresh token")]
pub struct InvalidRefresh;

impl RefreshOutcome {
    pub fn into_client_result(self) -> std::result::Result<IssuedTokens, InvalidRefresh> {
        match self {
            RefreshOutcome::Refreshed(tokens) => Ok(tokens),
            _ => Err(InvalidRefresh),
        }
    }
}

/// Which validation rule matched for a token that exists, in priority
/// order. First match wins; an unknown hash short-circuits before this
/// (rule 1, `Invalid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshRule {
    Reuse,
    Expired,
    DeviceMismatch,
    Rotate,
}

pub(crate) fn classify(token: &RefreshToken, device_id: &str, now: DateTime<Utc>) -> RefreshRule {
    if !token.is_active() {
        RefreshRule::Reuse
    } else if token.is_expired(now) {
        RefreshRule::Expired
    } else if !token.matches_device(device_id) {
        RefreshRule::DeviceMismatch
    } else {
        RefreshRule::Rotate
    }
}

pub struct RefreshService {
    pool: PgPool,
    issuer: Arc<dyn AccessTokenIssuer>,
    config: TokenConfig,
}

impl RefreshService {
    pub fn new(pool: PgPool, issuer: Arc<dyn AccessTokenIssuer>, config: TokenConfig) -> Self {
        Self {
            pool,
            issuer,
            config,
        }
    }

    /// Issue the first refresh token of a session after the caller has
    /// authenticated the user by other means.
    pub async fn login(&self, user_id: Uuid, device_id: &str) -> Result<IssuedTokens> {
        let now = Utc::now();
        let (secret, secret_hash) = generate_refresh_secret();
        let expires_at = now + self.config.refresh_ttl;

        let mut token = RefreshToken::issue(user_id, device_id, secret_hash, expires_at, now);
        let access_token = self.issuer.issue(user_id).await?;

        let mut tx = self.pool.begin().await?;
        repository::persist(&mut tx, &mut token).await?;
        tx.commit().await?;

        info!(%user_id, token_id = %token.id(), "refresh token issued");
        Ok(IssuedTokens {
            access_token,
            refresh_token: secret,
            refresh_expires_at: expires_at,
            user_id,
        })
    }

    /// Validate a presented refresh token and, when it passes, rotate it
    /// and issue a new access token. Every security failure is persisted
    /// (with its events) before returning the typed outcome.
    pub async fn refresh(&self, presented_secret: &str, device_id: &str) -> Result<RefreshOutcome> {
        let now = Utc::now();
        let secret_hash = hash_secret(presented_secret);

        let mut tx = self.pool.begin().await?;
        let Some(mut token) = repository::find_by_hash(&mut tx, &secret_hash).await? else {
            // Nothing to mark; the open transaction is dropped.
            return Ok(RefreshOutcome::Invalid);
        };

        match classify(&token, device_id, now) {
            RefreshRule::Reuse => {
                warn!(
                    user_id = %token.user_id(),
                    token_id = %token.id(),
                    previous_status = %token.status(),
                    "refresh token reuse detected; compromising the user's token chain"
                );

                token.mark_reuse(now, true);
                let mut siblings =
                    repository::find_active_for_user(&mut tx, token.user_id(), token.id()).await?;
                for sibling in &mut siblings {
                    sibling.mark_chain_compromised(now);
                }

                repository::persist(&mut tx, &mut token).await?;
                for sibling in &mut siblings {
                    repository::persist(&mut tx, sibling).await?;
                }
                tx.commit().await?;
                Ok(RefreshOutcome::Revoked)
            }
            RefreshRule::Expired => {
                info!(
                    user_id = %token.user_id(),
                    token_id = %token.id(),
                    "expired refresh token presented; revoking"
                );

                token.mark_expired(now);
                repository::persist(&mut tx, &mut token).await?;
                tx.commit().await?;
                Ok(RefreshOutcome::Expired)
            }
            RefreshRule::DeviceMismatch => {
                error!(
                    user_id = %token.user_id(),
                    token_id = %token.id(),
                    "refresh token presented from an unbound device; compromising"
                );

                token.mark_device_mismatch(now, device_id);
                repository::persist(&mut tx, &mut token).await?;
                tx.commit().await?;
                Ok(RefreshOutcome::InvalidDevice)
            }
            RefreshRule::Rotate => {
                let (secret, secret_hash) = generate_refresh_secret();
                let expires_at = now + self.config.refresh_ttl;

                let mut successor = token.rotate(secret_hash, expires_at, now)?;
                // Issued before commit: if issuance fails the rotation
                // rolls back and the presented token stays usable.
                let access_token = self.issuer.issue(token.user_id()).await?;

                // The old row's replaced_by_id references the successor,
                // so the successor is inserted first.
                repository::persist(&mut tx, &mut successor).await?;
                repository::persist(&mut tx, &mut token).await?;
                tx.commit().await?;

                info!(
                    user_id = %token.user_id(),
                    token_id = %token.id(),
                    successor_id = %successor.id(),
                    "refresh token rotated"
                );
                Ok(RefreshOutcome::Refreshed(IssuedTokens {
                    access_token,
                    refresh_token: secret,
                    refresh_expires_at: expires_at,
                    user_id: token.user_id(),
                }))
            }
        }
    }
}

/// SHA-256 hex digest of a refresh secret; the only form ever persisted.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn generate_refresh_secret() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);
    let hash = hash_secret(&secret);
    (secret, hash)
}
