// Main entry point for the extraction-engine API server.

use std::sync::Arc;

use anyhow::{Context, Result};
use crawl_engine::{ChapterLedger, MemoryLedger, PostgresStore, RedisLedger};
use server_core::supervisor::TaskSupervisor;
use server_core::{build_app, AppState, ServerConfig, StreamHub};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,crawl_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting extraction engine API");

    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // A missing ledger only costs the skip optimization, never the crawl.
    let ledger: Arc<dyn ChapterLedger> = match RedisLedger::connect(&config.redis_url).await {
        Ok(ledger) => {
            tracing::info!("Ledger connected");
            Arc::new(ledger)
        }
        Err(e) => {
            tracing::warn!(error = %e, "ledger unavailable, falling back to in-process sets");
            Arc::new(MemoryLedger::new())
        }
    };

    let hub = StreamHub::new();
    let documents = Arc::new(PostgresStore::new(pool.clone()));
    let supervisor = TaskSupervisor::new(
        pool.clone(),
        hub.clone(),
        ledger,
        documents,
        config.config_dir.clone(),
        None,
    );
    supervisor.reclaim_zombies().await;

    let app = build_app(AppState {
        pool,
        hub,
        supervisor,
        config_dir: config.config_dir.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
