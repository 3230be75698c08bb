//! AuthRelay Transactional Outbox
//!
//! Captures domain events in the same transaction as the state change that
//! produced them, then delivers them asynchronously to in-process
//! subscribers. Delivery is safe under concurrent worker replicas: claims
//! rely solely on the database's non-blocking row locking, no external
//! coordination service.

pub mod capture;
pub mod cleanup;
pub mod postgres;
pub mod registry;
pub mod repository;
pub mod router;

#[cfg(test)]
pub(crate) mod test_support;

use ar_common::{DispatchConfig, Result};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

pub use cleanup::OutboxCleaner;
pub use registry::{DecodeFn, EventRegistry};
pub use repository::{ClaimedBatch, MessageOutcome, OutboxRepository};
pub use router::{EventHandler, EventRouter};

/// Counters for one dispatch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub parked: usize,
    pub poisoned: usize,
}

/// Outbox dispatch worker.
///
/// Runs on a fixed interval with at most one run active at a time: the run
/// loop awaits each pass before sleeping, so a slow pass skips ticks rather
/// than overlapping itself. Cross-process overlap is handled by the
/// repository's non-blocking claim.
pub struct OutboxDispatcher<E> {
    repository: Arc<dyn OutboxRepository>,
    registry: Arc<EventRegistry<E>>,
    router: Arc<EventRouter<E>>,
    config: DispatchConfig,
    cancelled: Arc<AtomicBool>,
}

impl<E: Send + Sync + 'static> OutboxDispatcher<E> {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        registry: Arc<EventRegistry<E>>,
        router: Arc<EventRouter<E>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            router,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with the run loop; setting it stops the worker between
    /// steps. A run cancelled mid-flight drops its claim transaction, so
    /// nothing durable changes.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// One dispatch pass: claim, decode, publish, record outcomes.
    pub async fn run_once(&self) -> Result<DispatchStats> {
        let batch = self
            .repository
            .claim(self.config.batch_size, self.config.max_attempts)
            .await?;
        let messages = batch.messages().to_vec();

        let mut stats = DispatchStats {
            claimed: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            batch.complete(Vec::new()).await?;
            return Ok(stats);
        }

        if self.is_cancelled() {
            // Dropping the batch releases the claim.
            return Ok(DispatchStats::default());
        }

        // Resolve payload types. A row that cannot be decoded is terminal
        // immediately; the attempt count is left unchanged.
        let mut outcomes = Vec::with_capacity(messages.len());
        let mut decoded = Vec::with_capacity(messages.len());
        for message in &messages {
            match self.registry.decode(&message.event_type, &message.content) {
                Ok(event) => decoded.push((message.clone(), event)),
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        "undecodable outbox message marked terminal: {}", e
                    );
                    outcomes.push(MessageOutcome::poisoned(message.id, e.to_string()));
                }
            }
        }

        // Publish with bounded concurrency. A failure or stall in one
        // message degrades to a per-row retryable outcome and never aborts
        // the batch.
        let max_attempts = self.config.max_attempts;
        let publish_timeout = self.config.publish_timeout;
        let published: Vec<MessageOutcome> = stream::iter(decoded)
            .map(|(message, event)| {
                let router = Arc::clone(&self.router);
                async move {
                    match timeout(publish_timeout, router.publish(&event)).await {
                        Ok(Ok(())) => MessageOutcome::delivered(message.id),
                        Ok(Err(e)) => {
                            MessageOutcome::retryable(&message, e.to_string(), max_attempts)
                        }
                        Err(_) => {
                            MessageOutcome::retryable(&message, "publish timed out", max_attempts)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.publish_concurrency)
            .collect()
            .await;
        outcomes.extend(published);

        if self.is_cancelled() {
            return Ok(DispatchStats::default());
        }

        for outcome in &outcomes {
            if outcome.is_delivered() {
                stats.delivered += 1;
            } else if outcome.is_poisoned() {
                stats.poisoned += 1;
            } else if outcome.is_parked() {
                stats.parked += 1;
                error!(message_id = %outcome.id, "outbox message parked after exhausting attempts");
            } else {
                stats.retried += 1;
            }
        }

        batch.complete(outcomes).await?;

        debug!(
            claimed = stats.claimed,
            delivered = stats.delivered,
            retried = stats.retried,
            parked = stats.parked,
            poisoned = stats.poisoned,
            "outbox dispatch run finished"
        );
        Ok(stats)
    }

    pub async fn start(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox dispatch worker"
        );
        loop {
            if self.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                // Claim/update failures abort the whole run; the claim
                // transaction rolled back, so retrying from scratch is safe.
                error!("Error running outbox dispatch: {}", e);
            }
            sleep(self.config.interval).await;
        }
        info!("Outbox dispatch worker stopped");
    }
}
