//! Transactional event capture.
//!
//! Converts the events buffered on an aggregate into outbox rows inserted
//! through the same transaction that persists the aggregate's state. A
//! failed transaction leaves neither durable, which removes the dual-write
//! hazard of updating state and separately notifying subscribers.

use ar_common::{AggregateRoot, OutboxMessage, Result};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Drain an aggregate's event buffer into staged outbox rows, preserving
/// the order in which the events were recorded.
pub fn drain_events<A: AggregateRoot>(aggregate: &mut A) -> Result<Vec<OutboxMessage>> {
    aggregate
        .take_events()
        .iter()
        .map(OutboxMessage::from_event)
        .collect()
}

/// Insert staged rows through the caller's open transaction.
pub async fn append_messages(
    tx: &mut Transaction<'_, Postgres>,
    messages: &[OutboxMessage],
) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
    let types: Vec<String> = messages.iter().map(|m| m.event_type.clone()).collect();
    let contents: Vec<String> = messages.iter().map(|m| m.content.clone()).collect();
    let occurred: Vec<DateTime<Utc>> = messages.iter().map(|m| m.occurred_at).collect();

    sqlx::query(
        r#"
        INSERT INTO outbox_messages (id, type, content, occurred_at)
        SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::timestamptz[])
        "#,
    )
    .bind(&ids)
    .bind(&types)
    .bind(&contents)
    .bind(&occurred)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Drain and insert in one step; returns the number of captured events.
pub async fn capture_events<A: AggregateRoot>(
    tx: &mut Transaction<'_, Postgres>,
    aggregate: &mut A,
) -> Result<usize> {
    let messages = drain_events(aggregate)?;
    append_messages(tx, &messages).await?;
    Ok(messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_common::OutboxEvent;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Bumped {
        n: u32,
    }

    impl OutboxEvent for Bumped {
        fn event_type(&self) -> &'static str {
            "test:counter:bumped"
        }
    }

    #[derive(Default)]
    struct Counter {
        value: u32,
        events: Vec<Bumped>,
    }

    impl Counter {
        fn bump(&mut self) {
            self.value += 1;
            self.record(Bumped { n: self.value });
        }
    }

    impl AggregateRoot for Counter {
        type Event = Bumped;

        fn record(&mut self, event: Bumped) {
            self.events.push(event);
        }

        fn take_events(&mut self) -> Vec<Bumped> {
            std::mem::take(&mut self.events)
        }

        fn pending_events(&self) -> &[Bumped] {
            &self.events
        }
    }

    #[test]
    fn drain_preserves_insertion_order_and_clears_buffer() {
        let mut counter = Counter::default();
        counter.bump();
        counter.bump();
        counter.bump();

        let staged = drain_events(&mut counter).unwrap();
        assert_eq!(staged.len(), 3);
        assert!(counter.pending_events().is_empty());

        let payloads: Vec<String> = staged.iter().map(|m| m.content.clone()).collect();
        assert_eq!(payloads, vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);
    }

    #[test]
    fn draining_twice_yields_nothing_new() {
        let mut counter = Counter::default();
        counter.bump();

        assert_eq!(drain_events(&mut counter).unwrap().len(), 1);
        assert!(drain_events(&mut counter).unwrap().is_empty());
    }
}
