// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic worker state sweeps.
//!
//! A build blocks a draining worker when one of the worker's creating or
//! created containers belongs to it and it is still pending or started.
//! Landing waits for every such build. Retiring only waits for one-off
//! builds and builds of non-interruptible jobs.

use sqlx::PgPool;
use tracing::info;

use crate::build::BuildStatus;
use crate::error::Result;

/// Sweeps that move workers along their lifecycle.
#[derive(Clone)]
pub struct WorkerLifecycle {
    pool: PgPool,
}

impl WorkerLifecycle {
    /// Create a new lifecycle sweeper.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Flip Running workers past their deadline to Stalled and clear their addresses.
    pub async fn stall_unresponsive_workers(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET state = 'stalled', addr = NULL, volume_url = NULL
            WHERE state = 'running' AND expires < NOW()
            RETURNING name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !names.is_empty() {
            info!(workers = ?names, "Stalled unresponsive workers");
        }
        Ok(names)
    }

    /// Move Landing workers with no unfinished builds to Landed.
    pub async fn land_finished_landing_workers(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET state = 'landed', addr = NULL, volume_url = NULL
            WHERE state = 'landing'
              AND name NOT IN (
                  SELECT c.worker_name
                  FROM containers c
                  JOIN builds b ON b.id = c.build_id
                  WHERE c.state IN ('creating', 'created')
                    AND b.status = ANY($1)
              )
            RETURNING name
            "#,
        )
        .bind(BuildStatus::unfinished())
        .fetch_all(&self.pool)
        .await?;

        if !names.is_empty() {
            info!(workers = ?names, "Landed workers");
        }
        Ok(names)
    }

    /// Delete Retiring workers with no unfinished one-off or non-interruptible builds.
    pub async fn delete_finished_retiring_workers(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM workers
            WHERE state = 'retiring'
              AND name NOT IN (
                  SELECT c.worker_name
                  FROM containers c
                  JOIN builds b ON b.id = c.build_id
                  LEFT JOIN jobs j ON j.id = b.job_id
                  WHERE c.state IN ('creating', 'created')
                    AND b.status = ANY($1)
                    AND (b.job_id IS NULL OR j.interruptible = false)
              )
            RETURNING name
            "#,
        )
        .bind(BuildStatus::unfinished())
        .fetch_all(&self.pool)
        .await?;

        if !names.is_empty() {
            info!(workers = ?names, "Deleted retired workers");
        }
        Ok(names)
    }
}
