//! Outbox Cleanup Worker
//!
//! Prunes old, successfully delivered rows in bounded batches. Parked and
//! poisoned rows (error recorded) are never deleted; they require manual
//! remediation and must stay visible.

use crate::repository::OutboxRepository;
use ar_common::{CleanupConfig, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info};

pub struct OutboxCleaner {
    repository: Arc<dyn OutboxRepository>,
    config: CleanupConfig,
    cancelled: Arc<AtomicBool>,
}

impl OutboxCleaner {
    pub fn new(repository: Arc<dyn OutboxRepository>, config: CleanupConfig) -> Self {
        Self {
            repository,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with the run loop; setting it stops the worker between
    /// steps.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// One cleanup pass: delete in batches of `batch_size` until a batch
    /// comes back short or the per-run cap is reached.
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.retention;
        let mut total_deleted = 0u64;

        for batch_no in 0..self.config.max_batches_per_run {
            if self.is_cancelled() {
                break;
            }

            let deleted = self
                .repository
                .delete_delivered_before(cutoff, self.config.batch_size)
                .await?;
            total_deleted += deleted;

            debug!(batch_no, deleted, "outbox cleanup batch finished");

            if deleted < self.config.batch_size as u64 {
                break;
            }

            if let Some(delay) = self.config.batch_delay {
                sleep(delay).await;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted, "pruned delivered outbox rows");
        }
        Ok(total_deleted)
    }

    pub async fn start(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_hours = self.config.retention.num_hours(),
            "Starting outbox cleanup worker"
        );
        loop {
            if self.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!("Error running outbox cleanup: {}", e);
            }
            sleep(self.config.interval).await;
        }
        info!("Outbox cleanup worker stopped");
    }
}
