use ar_common::{OutboxMessage, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of one claimed message within a dispatch run.
///
/// Outcomes are accumulated during a run and applied to the claimed rows in
/// a single batched update when the batch completes.
#[derive(Debug, Clone)]
pub struct MessageOutcome {
    pub id: Uuid,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt_delta: i32,
}

impl MessageOutcome {
    /// Published to every subscriber. Terminal success; clears any error
    /// recorded by earlier failed attempts.
    pub fn delivered(id: Uuid) -> Self {
        Self {
            id,
            processed_at: Some(Utc::now()),
            error: None,
            attempt_delta: 0,
        }
    }

    /// Unresolvable type or corrupt payload. Terminal on first encounter
    /// with the attempt count unchanged: a schema problem will not self-heal.
    pub fn poisoned(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            processed_at: Some(Utc::now()),
            error: Some(error.into()),
            attempt_delta: 0,
        }
    }

    /// Subscriber failure or publish stall. The attempt count is incremented;
    /// when this failure exhausts the attempt budget the row is parked
    /// (terminal, excluded from future claims).
    pub fn retryable(message: &OutboxMessage, error: impl Into<String>, max_attempts: i32) -> Self {
        let exhausted = message.attempt_count + 1 >= max_attempts;
        Self {
            id: message.id,
            processed_at: exhausted.then(Utc::now),
            error: Some(error.into()),
            attempt_delta: 1,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.processed_at.is_some() && self.error.is_none()
    }

    pub fn is_parked(&self) -> bool {
        self.processed_at.is_some() && self.error.is_some() && self.attempt_delta > 0
    }

    pub fn is_poisoned(&self) -> bool {
        self.processed_at.is_some() && self.error.is_some() && self.attempt_delta == 0
    }
}

/// Storage backend for outbox rows.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claim up to `batch_size` undelivered rows, oldest first, skipping
    /// rows already claimed by a concurrent runner. Claimed rows stay
    /// invisible to other runners until the batch completes or is dropped.
    async fn claim(&self, batch_size: u32, max_attempts: i32) -> Result<Box<dyn ClaimedBatch>>;

    /// Delete up to `limit` successfully delivered rows older than `cutoff`.
    /// Rows with a recorded error are never deleted regardless of age.
    async fn delete_delivered_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64>;
}

/// A batch of rows claimed for one dispatch run.
///
/// Dropping the batch without completing it releases the claim with nothing
/// durable changed, so an aborted run is safe to retry from scratch.
#[async_trait]
pub trait ClaimedBatch: Send {
    fn messages(&self) -> &[OutboxMessage];

    /// Apply all outcomes in one batched update and release the claim.
    async fn complete(self: Box<Self>, outcomes: Vec<MessageOutcome>) -> Result<()>;
}
