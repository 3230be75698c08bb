//! RefreshToken Aggregate
//!
//! Token lifecycle entity and the primary producer of security events.
//! Transitions are monotonic toward a terminal state: `Active` moves to
//! `Revoked` or `Compromised`, both terminal and idempotent under
//! re-marking. Tokens are never deleted; successive rotations form an
//! append-only chain for audit.

use crate::events::{
    ChainCompromised, DeviceMismatchDetected, TokenEvent, TokenExpiredUsage, TokenIssued,
    TokenReuseDetected, TokenRotated,
};
use ar_common::{AggregateRoot, AuthRelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Active,
    Revoked,
    Compromised,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "ACTIVE",
            TokenStatus::Revoked => "REVOKED",
            TokenStatus::Compromised => "COMPROMISED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(TokenStatus::Active),
            "REVOKED" => Some(TokenStatus::Revoked),
            "COMPROMISED" => Some(TokenStatus::Compromised),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenStatus::Active)
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refresh token. Only the SHA-256 digest of the secret is ever held;
/// the raw secret lives solely in the client's hands.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub(crate) id: Uuid,
    pub(crate) token_hash: String,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) user_id: Uuid,
    pub(crate) device_id: String,
    pub(crate) status: TokenStatus,
    pub(crate) revoked_at: Option<DateTime<Utc>>,
    pub(crate) replaced_by_id: Option<Uuid>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) modified_at: DateTime<Utc>,
    pub(crate) events: Vec<TokenEvent>,
}

impl RefreshToken {
    /// Create a new `Active` token on successful login or rotation.
    pub fn issue(
        user_id: Uuid,
        device_id: impl Into<String>,
        token_hash: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let device_id = device_id.into();
        let mut token = Self {
            id: Uuid::now_v7(),
            token_hash,
            expires_at,
            user_id,
            device_id: device_id.clone(),
            status: TokenStatus::Active,
            revoked_at: None,
            replaced_by_id: None,
            created_at: now,
            modified_at: now,
            events: Vec::new(),
        };
        token.record(TokenEvent::Issued(TokenIssued {
            token_id: token.id,
            user_id,
            device_id,
            expires_at,
        }));
        token
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    pub fn status(&self) -> TokenStatus {
        self.status
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revoked_at
    }

    pub fn replaced_by_id(&self) -> Option<Uuid> {
        self.replaced_by_id
    }

    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Validity: active and not yet expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.is_expired(now)
    }

    /// Device binding uses bare equality on the identifier.
    pub fn matches_device(&self, device_id: &str) -> bool {
        self.device_id == device_id
    }

    /// Exchange this token for a successor. The successor starts `Active`;
    /// this token becomes `Revoked` with `replaced_by_id` pointing at it.
    /// Only an `Active` token can rotate.
    pub fn rotate(
        &mut self,
        new_token_hash: String,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RefreshToken> {
        if self.status != TokenStatus::Active {
            return Err(AuthRelayError::InvalidTransition {
                action: "rotate",
                status: self.status.to_string(),
            });
        }

        let successor = RefreshToken::issue(
            self.user_id,
            self.device_id.clone(),
            new_token_hash,
            new_expires_at,
            now,
        );

        self.status = TokenStatus::Revoked;
        self.revoked_at = Some(now);
        self.replaced_by_id = Some(successor.id);
        self.modified_at = now;
        self.record(TokenEvent::Rotated(TokenRotated {
            token_id: self.id,
            replaced_by_id: successor.id,
            user_id: self.user_id,
            rotated_at: now,
        }));

        Ok(successor)
    }

    /// An expired token was presented. `Active -> Revoked`; a no-op on a
    /// token that is already terminal.
    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        if self.status != TokenStatus::Active {
            return;
        }
        self.status = TokenStatus::Revoked;
        self.revoked_at = Some(now);
        self.modified_at = now;
        self.record(TokenEvent::ExpiredUsage(TokenExpiredUsage {
            token_id: self.id,
            user_id: self.user_id,
            expired_at: self.expires_at,
            used_at: now,
        }));
    }

    /// The token was presented from a device it is not bound to.
    /// `Active -> Compromised`; a no-op on a terminal token.
    pub fn mark_device_mismatch(&mut self, now: DateTime<Utc>, presented_device_id: &str) {
        if self.status != TokenStatus::Active {
            return;
        }
        self.status = TokenStatus::Compromised;
        self.revoked_at = Some(now);
        self.modified_at = now;
        self.record(TokenEvent::DeviceMismatch(DeviceMismatchDetected {
            token_id: self.id,
            user_id: self.user_id,
            bound_device_id: self.device_id.clone(),
            presented_device_id: presented_device_id.to_string(),
            detected_at: now,
        }));
        self.record(TokenEvent::ReuseDetected(TokenReuseDetected {
            token_id: self.id,
            user_id: self.user_id,
            previous_status: TokenStatus::Active,
            chain_affected: false,
            detected_at: now,
        }));
    }

    /// A non-`Active` token was presented again. Moves to `Compromised`;
    /// a complete no-op (no state change, no events) when already there.
    /// `revoked_at` set by an earlier transition is never reset.
    pub fn mark_reuse(&mut self, now: DateTime<Utc>, chain_affected: bool) {
        let previous_status = match self.status {
            TokenStatus::Compromised => return,
            other => other,
        };

        self.status = TokenStatus::Compromised;
        if self.revoked_at.is_none() {
            self.revoked_at = Some(now);
        }
        self.modified_at = now;
        self.record(TokenEvent::ReuseDetected(TokenReuseDetected {
            token_id: self.id,
            user_id: self.user_id,
            previous_status,
            chain_affected,
            detected_at: now,
        }));
        if chain_affected {
            self.record(TokenEvent::ChainCompromised(ChainCompromised {
                user_id: self.user_id,
                source_token_id: self.id,
                compromised_at: now,
            }));
        }
    }

    /// This token is collateral of a breach detected on a sibling. The
    /// `ChainCompromised` event emitted by the presented token covers the
    /// audit trail; the sibling transition itself is silent.
    pub fn mark_chain_compromised(&mut self, now: DateTime<Utc>) {
        if self.status != TokenStatus::Active {
            return;
        }
        self.status = TokenStatus::Compromised;
        self.revoked_at = Some(now);
        self.modified_at = now;
    }
}

impl AggregateRoot for RefreshToken {
    type Event = TokenEvent;

    fn record(&mut self, event: TokenEvent) {
        self.events.push(event);
    }

    fn take_events(&mut self) -> Vec<TokenEvent> {
        std::mem::take(&mut self.events)
    }

    fn pending_events(&self) -> &[TokenEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn active_token(now: DateTime<Utc>) -> RefreshToken {
        let mut token = RefreshToken::issue(
            Uuid::now_v7(),
            "device-1",
            "hash-0".to_string(),
            now + Duration::days(30),
            now,
        );
        token.take_events();
        token
    }

    #[test]
    fn issue_starts_active_and_records_the_issued_event() {
        let now = Utc::now();
        let token = RefreshToken::issue(
            Uuid::now_v7(),
            "device-1",
            "hash-0".to_string(),
            now + Duration::days(30),
            now,
        );
        assert!(token.is_valid(now));
        assert!(matches!(token.pending_events(), [TokenEvent::Issued(_)]));
    }

    #[test]
    fn rotations_form_one_acyclic_chain_with_a_single_active_tail() {
        let now = Utc::now();
        let expiry = now + Duration::days(30);
        let mut chain = vec![active_token(now)];

        for i in 1..=3 {
            let successor = {
                let current = chain.last_mut().unwrap();
                current
                    .rotate(format!("hash-{}", i), expiry, now)
                    .unwrap()
            };
            chain.push(successor);
        }

        let active: Vec<&RefreshToken> = chain.iter().filter(|t| t.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert!(active[0].replaced_by_id().is_none());

        let mut visited = HashSet::new();
        for pair in chain.windows(2) {
            assert_eq!(pair[0].status(), TokenStatus::Revoked);
            assert_eq!(pair[0].replaced_by_id(), Some(pair[1].id()));
            assert!(visited.insert(pair[0].id()), "chain revisited a token");
        }
    }

    #[test]
    fn rotate_requires_an_active_token() {
        let now = Utc::now();
        let mut token = active_token(now);
        token.mark_expired(now);

        let err = token
            .rotate("hash-1".to_string(), now + Duration::days(30), now)
            .unwrap_err();
        assert!(matches!(err, AuthRelayError::InvalidTransition { action: "rotate", .. }));
    }

    #[test]
    fn mark_expired_is_a_noop_on_terminal_tokens() {
        let now = Utc::now();
        let mut token = active_token(now);

        token.mark_expired(now);
        let revoked_at = token.revoked_at();
        assert_eq!(token.pending_events().len(), 1);

        token.mark_expired(now + Duration::minutes(5));
        assert_eq!(token.revoked_at(), revoked_at);
        assert_eq!(token.pending_events().len(), 1);
    }

    #[test]
    fn remarking_a_compromised_token_is_idempotent() {
        let now = Utc::now();
        let mut token = active_token(now);
        token.mark_expired(now);
        token.take_events();

        token.mark_reuse(now, true);
        assert_eq!(token.status(), TokenStatus::Compromised);
        assert_eq!(token.pending_events().len(), 2);

        let revoked_at = token.revoked_at();
        token.mark_reuse(now + Duration::minutes(1), true);
        assert_eq!(token.status(), TokenStatus::Compromised);
        assert_eq!(token.revoked_at(), revoked_at);
        assert_eq!(token.pending_events().len(), 2);
    }

    #[test]
    fn reuse_keeps_the_original_revocation_timestamp() {
        let now = Utc::now();
        let mut token = active_token(now);
        token
            .rotate("hash-1".to_string(), now + Duration::days(30), now)
            .unwrap();
        token.take_events();
        let revoked_at = token.revoked_at();
        assert!(revoked_at.is_some());

        let later = now + Duration::hours(2);
        token.mark_reuse(later, false);
        assert_eq!(token.revoked_at(), revoked_at);

        match token.pending_events() {
            [TokenEvent::ReuseDetected(event)] => {
                assert_eq!(event.previous_status, TokenStatus::Revoked);
                assert!(!event.chain_affected);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn chain_reuse_emits_the_chain_compromised_event() {
        let now = Utc::now();
        let mut token = active_token(now);
        token.mark_expired(now);
        token.take_events();

        token.mark_reuse(now, true);
        match token.pending_events() {
            [TokenEvent::ReuseDetected(reuse), TokenEvent::ChainCompromised(chain)] => {
                assert!(reuse.chain_affected);
                assert_eq!(chain.user_id, token.user_id());
                assert_eq!(chain.source_token_id, token.id());
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn chain_compromise_only_touches_active_siblings() {
        let now = Utc::now();
        let mut active = active_token(now);
        let mut revoked = active_token(now);
        revoked.mark_expired(now - Duration::hours(1));
        let original_revoked_at = revoked.revoked_at();

        let later = now + Duration::hours(1);
        active.mark_chain_compromised(later);
        revoked.mark_chain_compromised(later);

        assert_eq!(active.status(), TokenStatus::Compromised);
        assert_eq!(active.revoked_at(), Some(later));
        assert_eq!(revoked.status(), TokenStatus::Revoked);
        assert_eq!(revoked.revoked_at(), original_revoked_at);
    }

    #[test]
    fn device_mismatch_emits_mismatch_and_reuse_events() {
        let now = Utc::now();
        let mut token = active_token(now);

        token.mark_device_mismatch(now, "device-2");
        assert_eq!(token.status(), TokenStatus::Compromised);
        match token.pending_events() {
            [TokenEvent::DeviceMismatch(mismatch), TokenEvent::ReuseDetected(reuse)] => {
                assert_eq!(mismatch.bound_device_id, "device-1");
                assert_eq!(mismatch.presented_device_id, "device-2");
                assert_eq!(reuse.previous_status, TokenStatus::Active);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn validity_requires_active_and_unexpired() {
        let now = Utc::now();
        let token = active_token(now);
        assert!(token.is_valid(now));
        assert!(!token.is_valid(now + Duration::days(31)));

        let mut revoked = active_token(now);
        revoked.mark_expired(now);
        assert!(!revoked.is_valid(now));
    }
}
