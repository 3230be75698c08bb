//! In-memory outbox store used by the worker tests.

use crate::registry::EventRegistry;
use crate::repository::{ClaimedBatch, MessageOutcome, OutboxRepository};
use ar_common::{OutboxMessage, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct TestEvent {
    pub seq: u32,
}

pub(crate) fn test_registry() -> EventRegistry<TestEvent> {
    let mut registry = EventRegistry::new();
    registry.register("test:event", |raw| serde_json::from_str(raw));
    registry
}

/// An undelivered row with an `occurred_at` offset by `seq` seconds, so the
/// seeded order is also the oldest-first claim order.
pub(crate) fn seeded_message(seq: u32) -> OutboxMessage {
    OutboxMessage {
        id: Uuid::now_v7(),
        event_type: "test:event".to_string(),
        content: format!("{{\"seq\":{}}}", seq),
        occurred_at: Utc::now() - Duration::hours(1) + Duration::seconds(seq as i64),
        processed_at: None,
        error: None,
        attempt_count: 0,
    }
}

#[derive(Default)]
struct MockState {
    rows: Vec<OutboxMessage>,
    claimed: HashSet<Uuid>,
}

/// Mirrors the PostgreSQL claim semantics: a single locked section hands
/// concurrent claimers disjoint subsets, and a batch dropped without
/// completing releases its claim with the rows unchanged.
pub(crate) struct MockOutboxRepository {
    state: Arc<Mutex<MockState>>,
}

impl MockOutboxRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn seed(&self, messages: Vec<OutboxMessage>) {
        self.state.lock().unwrap().rows.extend(messages);
    }

    pub fn snapshot(&self) -> Vec<OutboxMessage> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn claimed_count(&self) -> usize {
        self.state.lock().unwrap().claimed.len()
    }
}

#[async_trait]
impl OutboxRepository for MockOutboxRepository {
    async fn claim(&self, batch_size: u32, max_attempts: i32) -> Result<Box<dyn ClaimedBatch>> {
        let mut state = self.state.lock().unwrap();

        let mut eligible: Vec<&OutboxMessage> = state
            .rows
            .iter()
            .filter(|m| {
                m.processed_at.is_none()
                    && m.attempt_count < max_attempts
                    && !state.claimed.contains(&m.id)
            })
            .collect();
        eligible.sort_by_key(|m| m.occurred_at);

        let messages: Vec<OutboxMessage> = eligible
            .into_iter()
            .take(batch_size as usize)
            .cloned()
            .collect();
        for message in &messages {
            state.claimed.insert(message.id);
        }

        Ok(Box::new(MockClaimedBatch {
            state: Arc::clone(&self.state),
            ids: messages.iter().map(|m| m.id).collect(),
            messages,
            released: false,
        }))
    }

    async fn delete_delivered_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<Uuid> = state
            .rows
            .iter()
            .filter(|m| m.processed_at.is_some() && m.error.is_none() && m.occurred_at < cutoff)
            .take(limit as usize)
            .map(|m| m.id)
            .collect();
        state.rows.retain(|m| !doomed.contains(&m.id));
        Ok(doomed.len() as u64)
    }
}

struct MockClaimedBatch {
    state: Arc<Mutex<MockState>>,
    ids: Vec<Uuid>,
    messages: Vec<OutboxMessage>,
    released: bool,
}

impl MockClaimedBatch {
    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        for id in &self.ids {
            state.claimed.remove(id);
        }
    }
}

#[async_trait]
impl ClaimedBatch for MockClaimedBatch {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    async fn complete(mut self: Box<Self>, outcomes: Vec<MessageOutcome>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            for outcome in outcomes {
                if let Some(row) = state.rows.iter_mut().find(|m| m.id == outcome.id) {
                    row.processed_at = outcome.processed_at;
                    row.error = outcome.error;
                    row.attempt_count += outcome.attempt_delta;
                }
            }
        }
        self.release();
        self.released = true;
        Ok(())
    }
}

impl Drop for MockClaimedBatch {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
