// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Releases finished build pins and deletes unreachable caches and configs.

use async_trait::async_trait;
use gantry_core::{CollectionReport, GcRepository};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::collector::Collector;
use crate::error::Result;

/// What one resource cache pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceCachePass {
    /// Build uses released because their build finished.
    pub released_uses: u64,
    /// Cache deletions.
    pub caches: CollectionReport,
    /// Config deletions.
    pub configs: CollectionReport,
}

/// Runs the resource cache GC in dependency order: dropping finished build
/// uses can make caches unreachable, and deleting caches can leave configs
/// unused.
pub struct ResourceCacheCollector {
    gc: GcRepository,
}

impl ResourceCacheCollector {
    /// Create a collector over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            gc: GcRepository::new(pool),
        }
    }

    /// Run one pass and report what was removed.
    pub async fn collect(&self) -> Result<ResourceCachePass> {
        let released_uses = self.gc.release_finished_build_uses().await?;
        let caches = self.gc.collect_unreachable_resource_caches().await?;
        let configs = self.gc.collect_unused_resource_configs().await?;

        if !caches.raced.is_empty() || !configs.raced.is_empty() {
            debug!(
                caches = ?caches.raced,
                configs = ?configs.raced,
                "Skipped rows that were pinned during collection"
            );
        }

        let pass = ResourceCachePass {
            released_uses,
            caches,
            configs,
        };
        if pass != ResourceCachePass::default() {
            info!(
                released_uses = pass.released_uses,
                caches_deleted = pass.caches.deleted.len(),
                configs_deleted = pass.configs.deleted.len(),
                "Resource cache collection pass complete"
            );
        }
        Ok(pass)
    }
}

#[async_trait]
impl Collector for ResourceCacheCollector {
    fn name(&self) -> &'static str {
        "resource-caches"
    }

    async fn run(&self) -> Result<()> {
        self.collect().await.map(|_| ())
    }
}
