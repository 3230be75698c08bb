//! In-process event router.
//!
//! Dispatches a decoded event to zero or more registered handlers. A
//! handler failure propagates to the dispatch worker, which records the
//! message as retryable; it never aborts the rest of the batch.

use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

pub struct EventRouter<E> {
    handlers: Vec<Arc<dyn EventHandler<E>>>,
}

impl<E: Send + Sync> EventRouter<E> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler<E>>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Deliver the event to every handler in registration order. The first
    /// failure stops delivery and surfaces as the message's error.
    pub async fn publish(&self, event: &E) -> anyhow::Result<()> {
        for handler in &self.handlers {
            handler.handle(event).await?;
        }
        Ok(())
    }
}

impl<E: Send + Sync> Default for EventRouter<E> {
    fn default() -> Self {
        Self::new()
    }
}
