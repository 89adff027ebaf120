// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives orphaned and failed containers towards teardown.

use async_trait::async_trait;
use gantry_core::{DbError, GcRepository};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::error::Result;

/// Containers moved by one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPass {
    /// Orphaned Created containers moved to Destroying.
    pub destroying: usize,
    /// Orphaned Creating containers moved to Failed.
    pub failed: usize,
    /// Failed containers moved to Destroying.
    pub failed_destroyed: u64,
}

/// Marks orphaned Created containers for destruction, fails orphaned Creating
/// containers, then moves every Failed container to Destroying.
///
/// Workers remove Destroying containers themselves; this collector never
/// deletes rows.
pub struct ContainerCollector {
    gc: GcRepository,
}

impl ContainerCollector {
    /// Create a collector over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            gc: GcRepository::new(pool),
        }
    }

    /// Run one pass and report what moved.
    pub async fn collect(&self) -> Result<ContainerPass> {
        let orphans = self.gc.find_orphaned_containers().await?;
        let mut pass = ContainerPass::default();

        for container in orphans.created {
            let handle = container.handle().to_string();
            match container.destroying().await {
                Ok(_) => pass.destroying += 1,
                Err(DbError::AlreadyTransitioned { .. }) => {
                    debug!(handle = %handle, "Orphaned container already moved on");
                }
                Err(e) => warn!(handle = %handle, error = %e, "Failed to mark container destroying"),
            }
        }

        for container in orphans.creating {
            let handle = container.handle().to_string();
            match container.failed().await {
                Ok(_) => pass.failed += 1,
                Err(DbError::AlreadyTransitioned { .. }) => {
                    debug!(handle = %handle, "Orphaned container already moved on");
                }
                Err(e) => warn!(handle = %handle, error = %e, "Failed to mark container failed"),
            }
        }

        pass.failed_destroyed = self.gc.destroy_failed_containers().await?;

        if pass != ContainerPass::default() {
            info!(
                destroying = pass.destroying,
                failed = pass.failed,
                failed_destroyed = pass.failed_destroyed,
                "Container collection pass complete"
            );
        }
        Ok(pass)
    }
}

#[async_trait]
impl Collector for ContainerCollector {
    fn name(&self) -> &'static str {
        "containers"
    }

    async fn run(&self) -> Result<()> {
        self.collect().await.map(|_| ())
    }
}
