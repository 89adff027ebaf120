// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Garbage collection queries.
//!
//! Each query computes a candidate set from the current table contents.
//! Predicates only fire on conditions that stay true once true, so a scan
//! followed by a delete is safe without locks. The one exception is
//! reachability of resource caches and configs: something may pin them
//! between scan and delete. The RESTRICT foreign keys turn that into a
//! `23503`, reported as [`DeleteOutcome::RaceDetected`].

use sqlx::PgPool;
use tracing::{debug, info};

use crate::build::BuildStatus;
use crate::container::{
    CONTAINER_COLUMNS, Container, ContainerRow, CreatedContainer, CreatingContainer,
    FailedContainer,
};
use crate::error::{ConstraintViolation, Result};

/// Outcome of deleting one GC candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The row was deleted.
    Deleted,
    /// The row no longer existed.
    AlreadyGone,
    /// Something referenced the row between scan and delete. Nothing changed.
    RaceDetected,
}

/// Ids handled by a collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// Rows deleted.
    pub deleted: Vec<i64>,
    /// Rows pinned again before they could be deleted.
    pub raced: Vec<i64>,
}

impl CollectionReport {
    fn record(&mut self, id: i64, outcome: DeleteOutcome) {
        match outcome {
            DeleteOutcome::Deleted => self.deleted.push(id),
            DeleteOutcome::RaceDetected => self.raced.push(id),
            DeleteOutcome::AlreadyGone => {}
        }
    }
}

/// Live containers nothing needs any more.
#[derive(Debug, Default)]
pub struct OrphanedContainers {
    /// Still provisioning. Fail them.
    pub creating: Vec<CreatingContainer>,
    /// Provisioned. Mark them for teardown.
    pub created: Vec<CreatedContainer>,
}

/// Candidate queries for containers, resource caches and configs.
#[derive(Clone)]
pub struct GcRepository {
    pool: PgPool,
}

impl GcRepository {
    /// Create a new GC repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creating and Created containers that qualify for collection.
    ///
    /// A container qualifies if any of these hold: its build is
    /// non-interceptible; its `best_if_used_by` has passed; it has no build,
    /// config or worker cache owner; it has a config owner but lost its
    /// worker base resource type; its worker cache is initialized; its
    /// worker cache's resource cache has no uses. Children of a parent that
    /// is still Creating never qualify.
    pub async fn find_orphaned_containers(&self) -> Result<OrphanedContainers> {
        let sql = format!(
            r#"
            SELECT {CONTAINER_COLUMNS}
            FROM containers c
            LEFT JOIN builds b ON b.id = c.build_id
            LEFT JOIN containers parent ON parent.id = c.parent_container_id
            LEFT JOIN worker_resource_caches wrc ON wrc.id = c.worker_resource_cache_id
            WHERE c.state IN ('creating', 'created')
              AND (parent.id IS NULL OR parent.state <> 'creating')
              AND (
                  (b.id IS NOT NULL AND b.interceptible = false)
                  OR c.best_if_used_by < NOW()
                  OR (c.build_id IS NULL AND c.resource_config_id IS NULL AND c.worker_resource_cache_id IS NULL)
                  OR (c.resource_config_id IS NOT NULL AND c.worker_base_resource_type_id IS NULL)
                  OR wrc.initialized = true
                  OR (wrc.id IS NOT NULL AND NOT EXISTS (
                      SELECT 1 FROM resource_cache_uses u
                      WHERE u.resource_cache_id = wrc.resource_cache_id
                  ))
              )
            ORDER BY c.id
            "#
        );

        let rows = sqlx::query_as::<_, ContainerRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let mut orphans = OrphanedContainers::default();
        for row in rows {
            match Container::from_row(&self.pool, row)? {
                Container::Creating(c) => orphans.creating.push(c),
                Container::Created(c) => orphans.created.push(c),
                Container::Destroying(_) | Container::Failed(_) => {}
            }
        }

        debug!(
            creating = orphans.creating.len(),
            created = orphans.created.len(),
            "Found orphaned containers"
        );
        Ok(orphans)
    }

    /// Every Failed container.
    pub async fn find_failed_containers(&self) -> Result<Vec<FailedContainer>> {
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers c WHERE c.state = 'failed' ORDER BY c.id"
        );
        let rows = sqlx::query_as::<_, ContainerRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            if let Container::Failed(c) = Container::from_row(&self.pool, row)? {
                failed.push(c);
            }
        }
        Ok(failed)
    }

    /// Move every Failed container to Destroying. Returns how many moved.
    pub async fn destroy_failed_containers(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE containers SET state = 'destroying' WHERE state = 'failed'")
                .execute(&self.pool)
                .await?;

        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "Marked failed containers for destruction");
        }
        Ok(result.rows_affected())
    }

    /// Caches referenced by none of: a use, a config, a build image, a next build input.
    pub async fn find_unreachable_resource_caches(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM resource_caches
            WHERE id NOT IN (
                SELECT resource_cache_id FROM resource_cache_uses
                UNION
                SELECT resource_cache_id FROM resource_configs WHERE resource_cache_id IS NOT NULL
                UNION
                SELECT resource_cache_id FROM build_image_resource_caches
                UNION
                SELECT resource_cache_id FROM next_build_inputs
            )
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Delete a resource cache. A pin that appeared since the scan is a race, not an error.
    pub async fn delete_resource_cache(&self, id: i64) -> Result<DeleteOutcome> {
        let result = sqlx::query("DELETE FROM resource_caches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        delete_outcome(result, "resource cache", id)
    }

    /// Delete every unreachable resource cache.
    pub async fn collect_unreachable_resource_caches(&self) -> Result<CollectionReport> {
        let mut report = CollectionReport::default();
        for id in self.find_unreachable_resource_caches().await? {
            let outcome = self.delete_resource_cache(id).await?;
            report.record(id, outcome);
        }

        if !report.deleted.is_empty() || !report.raced.is_empty() {
            info!(
                deleted = report.deleted.len(),
                raced = report.raced.len(),
                "Collected unreachable resource caches"
            );
        }
        Ok(report)
    }

    /// Drop the uses held by builds that finished and can no longer be intercepted.
    pub async fn release_finished_build_uses(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_cache_uses u
            USING builds b
            WHERE u.build_id = b.id
              AND NOT (b.status = ANY($1))
              AND b.interceptible = false
            "#,
        )
        .bind(BuildStatus::unfinished())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "Released resource cache uses of finished builds");
        }
        Ok(result.rows_affected())
    }

    /// Delete configs that no cache and no container references.
    pub async fn collect_unused_resource_configs(&self) -> Result<CollectionReport> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT rc.id FROM resource_configs rc
            WHERE NOT EXISTS (SELECT 1 FROM resource_caches rca WHERE rca.resource_config_id = rc.id)
              AND NOT EXISTS (SELECT 1 FROM containers c WHERE c.resource_config_id = rc.id)
            ORDER BY rc.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = CollectionReport::default();
        for id in ids {
            let result = sqlx::query(
                r#"
                DELETE FROM resource_configs rc
                WHERE rc.id = $1
                  AND NOT EXISTS (SELECT 1 FROM resource_caches rca WHERE rca.resource_config_id = rc.id)
                  AND NOT EXISTS (SELECT 1 FROM containers c WHERE c.resource_config_id = rc.id)
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await;
            report.record(id, delete_outcome(result, "resource config", id)?);
        }

        if !report.deleted.is_empty() {
            info!(deleted = report.deleted.len(), "Collected unused resource configs");
        }
        Ok(report)
    }
}

fn delete_outcome(
    result: std::result::Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
    kind: &str,
    id: i64,
) -> Result<DeleteOutcome> {
    match result {
        Ok(done) if done.rows_affected() > 0 => Ok(DeleteOutcome::Deleted),
        Ok(_) => Ok(DeleteOutcome::AlreadyGone),
        Err(err) => match ConstraintViolation::classify(&err) {
            Some(ConstraintViolation::ForeignKey { constraint }) => {
                debug!(
                    kind,
                    id,
                    constraint = constraint.as_deref().unwrap_or("unknown"),
                    "Delete lost a race with a new reference"
                );
                Ok(DeleteOutcome::RaceDetected)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_ignores_already_gone() {
        let mut report = CollectionReport::default();
        report.record(1, DeleteOutcome::Deleted);
        report.record(2, DeleteOutcome::AlreadyGone);
        report.record(3, DeleteOutcome::RaceDetected);
        assert_eq!(report.deleted, vec![1]);
        assert_eq!(report.raced, vec![3]);
    }

    #[test]
    fn test_non_constraint_delete_errors_propagate() {
        let outcome = delete_outcome(Err(sqlx::Error::PoolTimedOut), "resource cache", 7);
        assert!(outcome.is_err());
    }
}
