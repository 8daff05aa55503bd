//! Backstop service.
//!
//! Main entry point. Loads configuration, prepares the database, starts the
//! primary processor and DLQ worker, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use backstop::{Config, Service, ServiceParts};
use backstop_core::{
    Clock, PostgresDlqStore, PostgresQueue, ProcfsProbe, RealClock, Storage, TracingEventHandler,
};
use backstop_pipeline::SimulatedHandler;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting backstop service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        concurrency = config.processor_concurrency,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let storage = Storage::new(db_pool.clone());
    storage.health_check().await.context("Database health check failed")?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let parts = ServiceParts {
        store: Arc::new(PostgresDlqStore::new(storage.dlq_messages.clone())),
        queue: Arc::new(PostgresQueue::new(
            storage.queue_items.clone(),
            clock.clone(),
            config.visibility_timeout(),
        )),
        handler: Arc::new(SimulatedHandler::new(clock.clone())),
        probe: Arc::new(ProcfsProbe::new(clock.clone())),
        events: Arc::new(TracingEventHandler),
        clock,
    };
    let service = Service::start(&config, parts)?;
    info!("Backstop is processing messages");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = service.shutdown(config.shutdown_timeout()).await {
        warn!(error = %e, "Graceful shutdown incomplete");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Backstop shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the tables and indexes if they are missing.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dlq_messages (
            id UUID PRIMARY KEY,
            message_id TEXT NOT NULL UNIQUE,
            original_message JSONB NOT NULL,
            error_reason TEXT NOT NULL,
            error_stack TEXT,
            error_type TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            dlq_retry_count INTEGER NOT NULL DEFAULT 0,
            first_failed_at TIMESTAMPTZ NOT NULL,
            last_failed_at TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            locked_by TEXT,
            locked_at TIMESTAMPTZ,
            next_retry_at TIMESTAMPTZ,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            replay_attempts JSONB NOT NULL DEFAULT '[]'::jsonb,
            resolved_at TIMESTAMPTZ,
            resolved_by TEXT,
            resolution_notes TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dlq_messages table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dlq_status_next_retry \
         ON dlq_messages(status, next_retry_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create dlq status index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dlq_error_type ON dlq_messages(error_type)")
        .execute(pool)
        .await
        .context("Failed to create dlq error type index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dlq_locked ON dlq_messages(locked_at) \
         WHERE locked_by IS NOT NULL",
    )
    .execute(pool)
    .await
    .context("Failed to create dlq lock index")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS live_queue (
            id BIGSERIAL PRIMARY KEY,
            message_id TEXT NOT NULL,
            envelope JSONB NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deliveries INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create live_queue table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_live_queue_visible ON live_queue(visible_at, id)",
    )
    .execute(pool)
    .await
    .context("Failed to create live queue index")?;

    Ok(())
}

/// Waits for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
