// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker stall, land and retire sweeps.

use async_trait::async_trait;
use gantry_core::WorkerLifecycle;
use sqlx::PgPool;
use tracing::info;

use crate::collector::Collector;
use crate::error::Result;

/// Workers moved by one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerPass {
    /// Workers moved to Stalled after missing their heartbeat deadline.
    pub stalled: Vec<String>,
    /// Landing workers moved to Landed.
    pub landed: Vec<String>,
    /// Retiring workers deleted.
    pub retired: Vec<String>,
}

/// Runs the worker stall, land and retire sweeps.
pub struct WorkerCollector {
    lifecycle: WorkerLifecycle,
}

impl WorkerCollector {
    /// Create a collector over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            lifecycle: WorkerLifecycle::new(pool),
        }
    }

    /// Run the three sweeps in order.
    pub async fn collect(&self) -> Result<WorkerPass> {
        let pass = WorkerPass {
            stalled: self.lifecycle.stall_unresponsive_workers().await?,
            landed: self.lifecycle.land_finished_landing_workers().await?,
            retired: self.lifecycle.delete_finished_retiring_workers().await?,
        };

        if pass != WorkerPass::default() {
            info!(
                stalled = ?pass.stalled,
                landed = ?pass.landed,
                retired = ?pass.retired,
                "Worker sweep complete"
            );
        }
        Ok(pass)
    }
}

#[async_trait]
impl Collector for WorkerCollector {
    fn name(&self) -> &'static str {
        "workers"
    }

    async fn run(&self) -> Result<()> {
        self.collect().await.map(|_| ())
    }
}
