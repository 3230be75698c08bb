use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Event Capture Model
// ============================================================================

/// A domain event that can be staged into the outbox.
///
/// Events are immutable facts named in past tense (`Rotated`, not `Rotate`).
/// They carry no identity of their own: the outbox row they are serialized
/// into provides the id and the `occurred_at` timestamp.
pub trait OutboxEvent: Serialize + Send + Sync {
    /// Logical type name stored as the outbox row discriminator,
    /// format: `{domain}:{aggregate}:{action}` (e.g. `auth:token:rotated`).
    fn event_type(&self) -> &'static str;
}

/// An aggregate that buffers pending domain events until it is persisted.
///
/// `record` appends with no side effect. `take_events` returns and clears
/// the buffer; it is invoked exactly once per aggregate, by the persistence
/// layer inside the save transaction, never by business logic. An event is
/// durable if and only if the state change that produced it is committed.
pub trait AggregateRoot {
    type Event: OutboxEvent;

    /// Buffer an event, preserving insertion order.
    fn record(&mut self, event: Self::Event);

    /// Drain the buffer. Persistence-layer use only.
    fn take_events(&mut self) -> Vec<Self::Event>;

    /// Pending events recorded since the last save.
    fn pending_events(&self) -> &[Self::Event];
}

// ============================================================================
// Outbox Message
// ============================================================================

/// A persisted outbox row.
///
/// Lifecycle: `processed_at` is null while the row is undelivered and
/// retryable. Once set with `error` null the row is terminal success; set
/// with `error` non-null the row is terminal failure ("parked" when the
/// attempt cap was reached, "poisoned" when the payload could not be
/// decoded). Parked and poisoned rows require manual remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// UUID v7, time-sortable.
    pub id: Uuid,
    /// Event type discriminator, resolved by the decode registry.
    pub event_type: String,
    /// Serialized JSON payload.
    pub content: String,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt_count: i32,
}

impl OutboxMessage {
    /// Stage a domain event as a fresh undelivered row.
    pub fn from_event<E: OutboxEvent>(event: &E) -> Result<Self> {
        Ok(Self {
            id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            content: serde_json::to_string(event)?,
            occurred_at: Utc::now(),
            processed_at: None,
            error: None,
            attempt_count: 0,
        })
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Configuration for the outbox dispatch worker.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Pause between runs. At most one run is active at a time.
    pub interval: Duration,
    /// Maximum rows claimed per run.
    pub batch_size: u32,
    /// Attempt cap; a row failing this many times is parked.
    pub max_attempts: i32,
    /// Bounded-concurrency degree for in-process publishing.
    pub publish_concurrency: usize,
    /// Per-message publish budget; a stall counts as a retryable failure.
    pub publish_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 50,
            max_attempts: 5,
            publish_concurrency: 5,
            publish_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the outbox cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Pause between runs; sparser than dispatch.
    pub interval: Duration,
    /// Successfully delivered rows older than this are deleted.
    pub retention: chrono::Duration,
    /// Rows deleted per batch.
    pub batch_size: u32,
    /// Cap on batches per run.
    pub max_batches_per_run: u32,
    /// Optional pause between batches within a run.
    pub batch_delay: Option<Duration>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: chrono::Duration::days(7),
            batch_size: 500,
            max_batches_per_run: 20,
            batch_delay: Some(Duration::from_millis(100)),
        }
    }
}

/// Configuration for refresh-token issuance.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Lifetime of a newly issued refresh token.
    pub refresh_ttl: chrono::Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: chrono::Duration::days(30),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthRelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid token transition: cannot {action} a {status} token")]
    InvalidTransition {
        action: &'static str,
        status: String,
    },

    #[error("Token issuance error: {0}")]
    TokenIssuance(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl AuthRelayError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthRelayError>;
