// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Collector - runs the GC and worker sweeps until interrupted.

use tracing::{info, warn};

use gantry_collector::{CollectorConfig, CollectorRuntime};
use gantry_core::DatabaseConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_collector=info,gantry_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = DatabaseConfig::from_env()?;
    let collector_config = CollectorConfig::from_env();

    info!(
        max_connections = config.max_connections,
        container_interval_secs = collector_config.container_interval.as_secs(),
        resource_cache_interval_secs = collector_config.resource_cache_interval.as_secs(),
        worker_interval_secs = collector_config.worker_interval.as_secs(),
        "Starting Gantry Collector"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("Connected to database");

    gantry_core::migrations::run_postgres(&pool).await?;
    info!("Database migrations applied");

    let runtime = CollectorRuntime::builder()
        .pool(pool.clone())
        .config(collector_config)
        .build()?
        .start();

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await;
    pool.close().await;

    info!("Gantry Collector shut down");

    Ok(())
}
