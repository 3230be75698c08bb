//! AuthRelay Outbox Processor
//!
//! Claims staged auth events from the PostgreSQL outbox table, publishes
//! them to in-process subscribers, and prunes delivered rows past the
//! retention window. Safe to run as multiple replicas: claims rely on the
//! database's non-blocking row locking only.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AR_DATABASE_URL` | - | PostgreSQL connection URL (required) |
//! | `AR_DISPATCH_INTERVAL_MS` | `1000` | Dispatch poll interval in milliseconds |
//! | `AR_DISPATCH_BATCH_SIZE` | `50` | Max messages claimed per dispatch pass |
//! | `AR_DISPATCH_MAX_ATTEMPTS` | `5` | Delivery attempts before a row is parked |
//! | `AR_PUBLISH_CONCURRENCY` | `5` | Concurrent publishes within a batch |
//! | `AR_PUBLISH_TIMEOUT_SECS` | `30` | Per-message publish timeout |
//! | `AR_CLEANUP_INTERVAL_SECS` | `3600` | Cleanup poll interval in seconds |
//! | `AR_CLEANUP_RETENTION_HOURS` | `168` | Age before delivered rows are pruned |
//! | `AR_CLEANUP_BATCH_SIZE` | `500` | Rows deleted per cleanup batch |
//! | `AR_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ar_common::{CleanupConfig, DispatchConfig};
use ar_outbox::postgres::PgOutboxRepository;
use ar_outbox::{EventHandler, EventRouter, OutboxCleaner, OutboxDispatcher};
use ar_tokens::{token_event_registry, PgRefreshTokenRepository, TokenEvent};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting AuthRelay Outbox Processor");

    // Configuration
    let database_url = env_required("AR_DATABASE_URL")?;
    let metrics_port: u16 = env_or_parse("AR_METRICS_PORT", 9090);

    let dispatch_config = DispatchConfig {
        interval: Duration::from_millis(env_or_parse("AR_DISPATCH_INTERVAL_MS", 1000)),
        batch_size: env_or_parse("AR_DISPATCH_BATCH_SIZE", 50),
        max_attempts: env_or_parse("AR_DISPATCH_MAX_ATTEMPTS", 5),
        publish_concurrency: env_or_parse("AR_PUBLISH_CONCURRENCY", 5),
        publish_timeout: Duration::from_secs(env_or_parse("AR_PUBLISH_TIMEOUT_SECS", 30)),
    };
    let cleanup_config = CleanupConfig {
        interval: Duration::from_secs(env_or_parse("AR_CLEANUP_INTERVAL_SECS", 3600)),
        retention: chrono::Duration::hours(env_or_parse("AR_CLEANUP_RETENTION_HOURS", 168)),
        batch_size: env_or_parse("AR_CLEANUP_BATCH_SIZE", 500),
        max_batches_per_run: 20,
        batch_delay: Some(Duration::from_millis(100)),
    };

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Database and schema
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    let outbox_repo = PgOutboxRepository::new(pool.clone());
    outbox_repo.init_schema().await?;
    PgRefreshTokenRepository::new(pool.clone()).init_schema().await?;
    let outbox_repo: Arc<dyn ar_outbox::OutboxRepository> = Arc::new(outbox_repo);
    info!("PostgreSQL outbox initialized");

    // Event routing
    let registry = Arc::new(token_event_registry());
    let mut router = EventRouter::new();
    router.register(Arc::new(SecurityEventLogger));
    let router = Arc::new(router);

    // Dispatch worker
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&outbox_repo),
        registry,
        router,
        dispatch_config,
    );
    let dispatcher_cancel = dispatcher.cancel_flag();
    let dispatcher_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Outbox dispatcher shutting down");
                }
            }
        })
    };

    // Cleanup worker
    let cleaner = OutboxCleaner::new(Arc::clone(&outbox_repo), cleanup_config);
    let cleaner_cancel = cleaner.cancel_flag();
    let cleaner_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = cleaner.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Outbox cleaner shutting down");
                }
            }
        })
    };

    // Metrics/health server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("AuthRelay Outbox Processor started");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    dispatcher_cancel.store(true, Ordering::SeqCst);
    cleaner_cancel.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = dispatcher_handle.await;
        let _ = cleaner_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("AuthRelay Outbox Processor shutdown complete");
    Ok(())
}

/// Routes every token event into the structured log, with severity scaled
/// to the security signal. Downstream consumers (alerting, SIEM ingest)
/// hang off the same router.
struct SecurityEventLogger;

#[async_trait]
impl EventHandler<TokenEvent> for SecurityEventLogger {
    async fn handle(&self, event: &TokenEvent) -> anyhow::Result<()> {
        match event {
            TokenEvent::Issued(e) => {
                info!(token_id = %e.token_id, user_id = %e.user_id, "token issued");
            }
            TokenEvent::Rotated(e) => {
                info!(
                    token_id = %e.token_id,
                    replaced_by_id = %e.replaced_by_id,
                    user_id = %e.user_id,
                    "token rotated"
                );
            }
            TokenEvent::ExpiredUsage(e) => {
                info!(token_id = %e.token_id, user_id = %e.user_id, "expired token presented");
            }
            TokenEvent::DeviceMismatch(e) => {
                warn!(
                    token_id = %e.token_id,
                    user_id = %e.user_id,
                    bound_device_id = %e.bound_device_id,
                    presented_device_id = %e.presented_device_id,
                    "token presented from unbound device"
                );
            }
            TokenEvent::ReuseDetected(e) => {
                error!(
                    token_id = %e.token_id,
                    user_id = %e.user_id,
                    previous_status = ?e.previous_status,
                    chain_affected = e.chain_affected,
                    "token reuse detected"
                );
            }
            TokenEvent::ChainCompromised(e) => {
                error!(
                    user_id = %e.user_id,
                    source_token_id = %e.source_token_id,
                    "user token chain compromised"
                );
            }
        }
        Ok(())
    }
}

async fn metrics_handler() -> String {
    "# HELP ar_outbox_up Outbox processor is up\n# TYPE ar_outbox_up gauge\nar_outbox_up 1\n"
        .to_string()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
