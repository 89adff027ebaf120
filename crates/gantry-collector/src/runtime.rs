// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime that runs every collector on its own interval.
//!
//! ```rust,ignore
//! use gantry_collector::{CollectorConfig, CollectorRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = CollectorRuntime::builder()
//!         .pool(pool)
//!         .config(CollectorConfig::from_env())
//!         .build()?
//!         .start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::collector::Collector;
use crate::config::CollectorConfig;
use crate::container_collector::ContainerCollector;
use crate::resource_cache_collector::ResourceCacheCollector;
use crate::worker_collector::WorkerCollector;

/// Builder for [`CollectorRuntime`].
#[derive(Default)]
pub struct CollectorRuntimeBuilder {
    pool: Option<PgPool>,
    config: Option<CollectorConfig>,
    extra: Vec<(Arc<dyn Collector>, Duration)>,
}

impl CollectorRuntimeBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PostgreSQL connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the sweep intervals. Defaults to [`CollectorConfig::default`].
    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Run an additional collector alongside the built-in ones.
    pub fn collector(mut self, collector: Arc<dyn Collector>, interval: Duration) -> Self {
        self.extra.push((collector, interval));
        self
    }

    /// Validate the builder and wire up the built-in collectors.
    pub fn build(self) -> Result<CollectorRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let config = self.config.unwrap_or_default();

        for (interval, name) in [
            (config.container_interval, "container_interval"),
            (config.resource_cache_interval, "resource_cache_interval"),
            (config.worker_interval, "worker_interval"),
        ] {
            if interval.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if let Some((collector, _)) = self.extra.iter().find(|(_, i)| i.is_zero()) {
            anyhow::bail!("interval for collector '{}' must be greater than zero", collector.name());
        }

        let mut collectors: Vec<(Arc<dyn Collector>, Duration)> = vec![
            (
                Arc::new(ContainerCollector::new(pool.clone())),
                config.container_interval,
            ),
            (
                Arc::new(ResourceCacheCollector::new(pool.clone())),
                config.resource_cache_interval,
            ),
            (
                Arc::new(WorkerCollector::new(pool)),
                config.worker_interval,
            ),
        ];
        collectors.extend(self.extra);

        Ok(CollectorRuntimeConfig { collectors })
    }
}

/// Validated runtime configuration, ready to [`start`](Self::start).
pub struct CollectorRuntimeConfig {
    collectors: Vec<(Arc<dyn Collector>, Duration)>,
}

impl CollectorRuntimeConfig {
    /// Names of the collectors that will run, in start order.
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|(c, _)| c.name()).collect()
    }

    /// Spawn one loop per collector. Must be called within a tokio runtime.
    pub fn start(self) -> CollectorRuntime {
        let loops = self
            .collectors
            .into_iter()
            .map(|(collector, interval)| {
                let shutdown = Arc::new(Notify::new());
                let name = collector.name();
                let handle = tokio::spawn(run_loop(collector, interval, shutdown.clone()));
                CollectorLoop {
                    name,
                    shutdown,
                    handle,
                }
            })
            .collect::<Vec<_>>();

        info!(collectors = loops.len(), "CollectorRuntime started");
        CollectorRuntime { loops }
    }
}

struct CollectorLoop {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Running collectors. Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CollectorRuntime {
    loops: Vec<CollectorLoop>,
}

impl CollectorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CollectorRuntimeBuilder {
        CollectorRuntimeBuilder::new()
    }

    /// Check if every collector loop is still running.
    pub fn is_running(&self) -> bool {
        self.loops.iter().all(|l| !l.handle.is_finished())
    }

    /// Signal every loop to stop and wait for them. A pass in progress is
    /// allowed to finish.
    pub async fn shutdown(self) {
        info!("CollectorRuntime shutting down...");

        for l in &self.loops {
            l.shutdown.notify_one();
        }

        for l in self.loops {
            if let Err(e) = l.handle.await {
                error!(collector = l.name, "Collector task panicked: {}", e);
            }
        }

        info!("CollectorRuntime shutdown complete");
    }
}

async fn run_loop(collector: Arc<dyn Collector>, interval: Duration, shutdown: Arc<Notify>) {
    let name = collector.name();
    info!(
        collector = name,
        interval_secs = interval.as_secs_f64(),
        "Collector started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                info!(collector = name, "Collector received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(interval) => {
                if let Err(e) = collector.run().await {
                    error!(
                        collector = name,
                        error = %e,
                        error_code = e.error_code(),
                        "Collection pass failed"
                    );
                }
            }
        }
    }

    info!(collector = name, "Collector stopped");
}
