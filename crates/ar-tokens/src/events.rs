//! Refresh-token domain events.
//!
//! One struct per event, wrapped in the `TokenEvent` tagged union. The
//! outbox row stores the type name from the constants below as its
//! discriminator and the inner struct as the JSON payload; the decode
//! registry maps the name back to the matching variant.

use crate::domain::TokenStatus;
use ar_common::OutboxEvent;
use ar_outbox::EventRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOKEN_ISSUED: &str = "auth:token:issued";
pub const TOKEN_ROTATED: &str = "auth:token:rotated";
pub const TOKEN_EXPIRED_USAGE: &str = "auth:token:expired-usage";
pub const DEVICE_MISMATCH_DETECTED: &str = "auth:token:device-mismatch";
pub const TOKEN_REUSE_DETECTED: &str = "auth:token:reuse-detected";
pub const CHAIN_COMPROMISED: &str = "auth:user:chain-compromised";

/// A new token entered the `Active` state (login or rotation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIssued {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
}

/// An `Active` token was exchanged for its successor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRotated {
    pub token_id: Uuid,
    pub replaced_by_id: Uuid,
    pub user_id: Uuid,
    pub rotated_at: DateTime<Utc>,
}

/// A token was presented after its expiry and revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExpiredUsage {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub expired_at: DateTime<Utc>,
    pub used_at: DateTime<Utc>,
}

/// A token was presented from a device other than the one it is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMismatchDetected {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub bound_device_id: String,
    pub presented_device_id: String,
    pub detected_at: DateTime<Utc>,
}

/// A non-`Active` token was presented again: a stolen or duplicated
/// credential. `previous_status` records what state the token was in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReuseDetected {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub previous_status: TokenStatus,
    pub chain_affected: bool,
    pub detected_at: DateTime<Utc>,
}

/// A breach invalidated every token belonging to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCompromised {
    pub user_id: Uuid,
    pub source_token_id: Uuid,
    pub compromised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TokenEvent {
    Issued(TokenIssued),
    Rotated(TokenRotated),
    ExpiredUsage(TokenExpiredUsage),
    DeviceMismatch(DeviceMismatchDetected),
    ReuseDetected(TokenReuseDetected),
    ChainCompromised(ChainCompromised),
}

impl OutboxEvent for TokenEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TokenEvent::Issued(_) => TOKEN_ISSUED,
            TokenEvent::Rotated(_) => TOKEN_ROTATED,
            TokenEvent::ExpiredUsage(_) => TOKEN_EXPIRED_USAGE,
            TokenEvent::DeviceMismatch(_) => DEVICE_MISMATCH_DETECTED,
            TokenEvent::ReuseDetected(_) => TOKEN_REUSE_DETECTED,
            TokenEvent::ChainCompromised(_) => CHAIN_COMPROMISED,
        }
    }
}

/// The name-to-decoder map for every known token event, built once at
/// process start and handed to the dispatch worker.
pub fn token_event_registry() -> EventRegistry<TokenEvent> {
    let mut registry = EventRegistry::new();
    registry.register(TOKEN_ISSUED, |raw| {
        serde_json::from_str::<TokenIssued>(raw).map(TokenEvent::Issued)
    });
    registry.register(TOKEN_ROTATED, |raw| {
        serde_json::from_str::<TokenRotated>(raw).map(TokenEvent::Rotated)
    });
    registry.register(TOKEN_EXPIRED_USAGE, |raw| {
        serde_json::from_str::<TokenExpiredUsage>(raw).map(TokenEvent::ExpiredUsage)
    });
    registry.register(DEVICE_MISMATCH_DETECTED, |raw| {
        serde_json::from_str::<DeviceMismatchDetected>(raw).map(TokenEvent::DeviceMismatch)
    });
    registry.register(TOKEN_REUSE_DETECTED, |raw| {
        serde_json::from_str::<TokenReuseDetected>(raw).map(TokenEvent::ReuseDetected)
    });
    registry.register(CHAIN_COMPROMISED, |raw| {
        serde_json::from_str::<ChainCompromised>(raw).map(TokenEvent::ChainCompromised)
    });
    registry
}
