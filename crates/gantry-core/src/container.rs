// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container state machine.
//!
//! Every container row is in exactly one [`ContainerState`]. Each state has
//! its own projection type exposing only the transitions legal from it:
//!
//! ```text
//!   Creating ──created()──► Created ──destroying()──► Destroying ──destroy()──► (row deleted)
//!      │
//!      └──failed()──► Failed ──destroying()──► Destroying
//! ```
//!
//! Transitions are `UPDATE ... WHERE state = <prior>`. Zero rows affected
//! means another actor won; the caller gets [`DbError::AlreadyTransitioned`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::error::{ConstraintViolation, DbError, Result};
use crate::find_or_create::{
    FindOrCreate, FindOrCreateError, FindOrCreateResult, RetryPolicy, safe_find_or_create,
};
use crate::owner::{ContainerIdentifier, ContainerOwner, ContainerStage};
use crate::resource_cache;
use crate::resource_config::{self, ResourceConfigDescriptor};

/// Lifecycle state of a container row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Being provisioned on the worker.
    Creating,
    /// Exists on the worker.
    Created,
    /// Marked for teardown.
    Destroying,
    /// Provisioning failed. Terminal.
    Failed,
}

impl ContainerState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "created" => Ok(Self::Created),
            "destroying" => Ok(Self::Destroying),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown container state '{}'", other)),
        }
    }
}

/// Free-form metadata describing what a container is for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerMetadata {
    /// Step type (task, get, put, check).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// Step name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Attempt numbers for retried steps.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<u32>,
    /// Working directory inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Environment as `KEY=value` pairs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_variables: Vec<String>,
    /// User processes run as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Pipeline, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<i64>,
    /// Job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
}

/// Placement and metadata for a new container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    /// Globally unique handle.
    pub handle: String,
    /// Worker the container is placed on.
    pub worker_name: String,
    /// Owning team.
    pub team_id: Option<i64>,
    /// Soft expiry after which GC may collect the container.
    pub best_if_used_by: Option<DateTime<Utc>>,
    /// Metadata.
    pub metadata: ContainerMetadata,
}

impl NewContainer {
    /// A container on `worker_name` with a generated handle.
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            handle: Uuid::new_v4().to_string(),
            worker_name: worker_name.into(),
            team_id: None,
            best_if_used_by: None,
            metadata: ContainerMetadata::default(),
        }
    }

    /// Use a caller-assigned handle.
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = handle.into();
        self
    }

    /// Set the owning team.
    pub fn with_team(mut self, team_id: i64) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Set the soft expiry.
    pub fn with_best_if_used_by(mut self, at: DateTime<Utc>) -> Self {
        self.best_if_used_by = Some(at);
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: ContainerMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

pub(crate) const CONTAINER_COLUMNS: &str = r#"
    c.id, c.handle, c.worker_name, c.state, c.stage, c.team_id,
    c.build_id, c.plan_id, c.resource_id, c.resource_config_id,
    c.worker_base_resource_type_id, c.worker_resource_cache_id,
    c.parent_container_id, c.best_if_used_by, c.metadata
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ContainerRow {
    id: i64,
    handle: String,
    worker_name: String,
    state: String,
    stage: String,
    team_id: Option<i64>,
    build_id: Option<i64>,
    plan_id: Option<String>,
    resource_id: Option<i64>,
    resource_config_id: Option<i64>,
    worker_base_resource_type_id: Option<i64>,
    worker_resource_cache_id: Option<i64>,
    parent_container_id: Option<i64>,
    best_if_used_by: Option<DateTime<Utc>>,
    metadata: Json<ContainerMetadata>,
}

/// Row data shared by every container projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    /// Row id.
    pub id: i64,
    /// Unique handle.
    pub handle: String,
    /// Hosting worker.
    pub worker_name: String,
    /// Stage.
    pub stage: ContainerStage,
    /// Owning team.
    pub team_id: Option<i64>,
    /// Build owner.
    pub build_id: Option<i64>,
    /// Plan node of the build owner.
    pub plan_id: Option<String>,
    /// Pipeline resource of a resource owner.
    pub resource_id: Option<i64>,
    /// Resource config owner.
    pub resource_config_id: Option<i64>,
    /// Worker base type the resource container runs on.
    pub worker_base_resource_type_id: Option<i64>,
    /// Worker cache a get container populates.
    pub worker_resource_cache_id: Option<i64>,
    /// Parent container of an image check/get.
    pub parent_container_id: Option<i64>,
    /// Soft expiry.
    pub best_if_used_by: Option<DateTime<Utc>>,
    /// Metadata.
    pub metadata: ContainerMetadata,
}

macro_rules! container_projection {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone)]
        pub struct $name {
            pool: PgPool,
            info: ContainerInfo,
        }

        impl $name {
            /// Row data.
            pub fn info(&self) -> &ContainerInfo {
                &self.info
            }

            /// Row id.
            pub fn id(&self) -> i64 {
                self.info.id
            }

            /// Unique handle.
            pub fn handle(&self) -> &str {
                &self.info.handle
            }

            /// Hosting worker.
            pub fn worker_name(&self) -> &str {
                &self.info.worker_name
            }
        }
    };
}

container_projection!(CreatingContainer, "A container being provisioned.");
container_projection!(CreatedContainer, "A container that exists on its worker.");
container_projection!(DestroyingContainer, "A container marked for teardown.");
container_projection!(FailedContainer, "A container whose provisioning failed.");

async fn transition(
    pool: &PgPool,
    info: &ContainerInfo,
    from: ContainerState,
    to: ContainerState,
) -> Result<()> {
    let result = sqlx::query("UPDATE containers SET state = $1 WHERE id = $2 AND state = $3")
        .bind(to.as_str())
        .bind(info.id)
        .bind(from.as_str())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::AlreadyTransitioned {
            handle: info.handle.clone(),
            expected: from,
        });
    }

    info!(
        handle = %info.handle,
        worker = %info.worker_name,
        from = %from,
        to = %to,
        "Container state changed"
    );

    Ok(())
}

impl CreatingContainer {
    /// The container now exists on the worker.
    pub async fn created(self) -> Result<CreatedContainer> {
        transition(&self.pool, &self.info, ContainerState::Creating, ContainerState::Created).await?;
        Ok(CreatedContainer {
            pool: self.pool,
            info: self.info,
        })
    }

    /// Provisioning failed.
    pub async fn failed(self) -> Result<FailedContainer> {
        transition(&self.pool, &self.info, ContainerState::Creating, ContainerState::Failed).await?;
        Ok(FailedContainer {
            pool: self.pool,
            info: self.info,
        })
    }
}

impl CreatedContainer {
    /// Mark for teardown.
    pub async fn destroying(self) -> Result<DestroyingContainer> {
        transition(
            &self.pool,
            &self.info,
            ContainerState::Created,
            ContainerState::Destroying,
        )
        .await?;
        Ok(DestroyingContainer {
            pool: self.pool,
            info: self.info,
        })
    }
}

impl FailedContainer {
    /// Hand the failed container to the reaper.
    pub async fn destroying(self) -> Result<DestroyingContainer> {
        transition(
            &self.pool,
            &self.info,
            ContainerState::Failed,
            ContainerState::Destroying,
        )
        .await?;
        Ok(DestroyingContainer {
            pool: self.pool,
            info: self.info,
        })
    }
}

impl DestroyingContainer {
    /// Delete the row once the worker has torn the container down.
    /// Returns false if the row was already gone.
    pub async fn destroy(self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM containers WHERE id = $1 AND state = 'destroying'")
            .bind(self.info.id)
            .execute(&self.pool)
            .await?;

        let destroyed = result.rows_affected() > 0;
        if destroyed {
            info!(handle = %self.info.handle, worker = %self.info.worker_name, "Container destroyed");
        }
        Ok(destroyed)
    }
}

/// A container projection in whatever state its row is in.
#[derive(Debug, Clone)]
pub enum Container {
    /// Being provisioned.
    Creating(CreatingContainer),
    /// Exists on the worker.
    Created(CreatedContainer),
    /// Marked for teardown.
    Destroying(DestroyingContainer),
    /// Provisioning failed.
    Failed(FailedContainer),
}

impl Container {
    pub(crate) fn from_row(pool: &PgPool, row: ContainerRow) -> Result<Self> {
        let state = ContainerState::from_str(&row.state).map_err(decode_error)?;
        let info = ContainerInfo {
            id: row.id,
            handle: row.handle,
            worker_name: row.worker_name,
            stage: ContainerStage::from_str(&row.stage).map_err(decode_error)?,
            team_id: row.team_id,
            build_id: row.build_id,
            plan_id: row.plan_id,
            resource_id: row.resource_id,
            resource_config_id: row.resource_config_id,
            worker_base_resource_type_id: row.worker_base_resource_type_id,
            worker_resource_cache_id: row.worker_resource_cache_id,
            parent_container_id: row.parent_container_id,
            best_if_used_by: row.best_if_used_by,
            metadata: row.metadata.0,
        };
        let pool = pool.clone();

        Ok(match state {
            ContainerState::Creating => Self::Creating(CreatingContainer { pool, info }),
            ContainerState::Created => Self::Created(CreatedContainer { pool, info }),
            ContainerState::Destroying => Self::Destroying(DestroyingContainer { pool, info }),
            ContainerState::Failed => Self::Failed(FailedContainer { pool, info }),
        })
    }

    /// Current state.
    pub fn state(&self) -> ContainerState {
        match self {
            Self::Creating(_) => ContainerState::Creating,
            Self::Created(_) => ContainerState::Created,
            Self::Destroying(_) => ContainerState::Destroying,
            Self::Failed(_) => ContainerState::Failed,
        }
    }

    /// Row data.
    pub fn info(&self) -> &ContainerInfo {
        match self {
            Self::Creating(c) => c.info(),
            Self::Created(c) => c.info(),
            Self::Destroying(c) => c.info(),
            Self::Failed(c) => c.info(),
        }
    }

    /// Unique handle.
    pub fn handle(&self) -> &str {
        &self.info().handle
    }
}

fn decode_error(message: String) -> DbError {
    DbError::Database(sqlx::Error::Decode(message.into()))
}

struct CreateContainer<'a> {
    owner: &'a ContainerOwner,
    new: &'a NewContainer,
}

/// Owner columns resolved inside the create transaction.
#[derive(Default)]
struct OwnerColumns {
    build_id: Option<i64>,
    plan_id: Option<String>,
    resource_id: Option<i64>,
    resource_config_id: Option<i64>,
    worker_base_resource_type_id: Option<i64>,
    worker_resource_cache_id: Option<i64>,
    image_resource_type: Option<String>,
    image_resource_source_hash: Option<String>,
    parent_container_id: Option<i64>,
}

impl CreateContainer<'_> {
    async fn resolve_owner(&self, conn: &mut PgConnection) -> FindOrCreateResult<OwnerColumns> {
        let columns = match self.owner {
            ContainerOwner::BuildStep {
                build_id, plan_id, ..
            } => OwnerColumns {
                build_id: Some(*build_id),
                plan_id: Some(plan_id.clone()),
                ..Default::default()
            },
            ContainerOwner::ParentContainer {
                parent_container_id,
                ..
            } => OwnerColumns {
                parent_container_id: Some(*parent_container_id),
                ..Default::default()
            },
            ContainerOwner::Resource {
                resource_id,
                config,
                image_resource,
                resource_cache_id,
                stage,
            } => {
                ensure_worker_present(conn, &self.new.worker_name).await?;
                let resource_config = resource_config::find_or_create_config(conn, config).await?;
                let worker_base_resource_type_id =
                    find_worker_base_resource_type(conn, &self.new.worker_name, config).await?;

                // owner() guarantees a cache id exactly for get containers.
                let worker_resource_cache_id = match (stage, resource_cache_id) {
                    (ContainerStage::Get, Some(cache_id)) => Some(
                        resource_cache::find_or_create_worker_resource_cache(
                            conn,
                            &self.new.worker_name,
                            *cache_id,
                        )
                        .await?
                        .id,
                    ),
                    _ => None,
                };

                OwnerColumns {
                    resource_id: *resource_id,
                    resource_config_id: Some(resource_config.id),
                    worker_base_resource_type_id: Some(worker_base_resource_type_id),
                    worker_resource_cache_id,
                    image_resource_type: image_resource.as_ref().map(|i| i.resource_type.clone()),
                    image_resource_source_hash: image_resource.as_ref().map(|i| i.source_hash()),
                    ..Default::default()
                }
            }
        };

        Ok(columns)
    }
}

async fn ensure_worker_present(conn: &mut PgConnection, worker_name: &str) -> FindOrCreateResult<()> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT name FROM workers WHERE name = $1 FOR SHARE")
            .bind(worker_name)
            .fetch_optional(&mut *conn)
            .await?;

    match found {
        Some(_) => Ok(()),
        None => Err(DbError::WorkerNotPresent(worker_name.to_string()).into()),
    }
}

async fn find_worker_base_resource_type(
    conn: &mut PgConnection,
    worker_name: &str,
    config: &ResourceConfigDescriptor,
) -> FindOrCreateResult<i64> {
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT wbrt.id
        FROM worker_base_resource_types wbrt
        JOIN base_resource_types b ON b.id = wbrt.base_resource_type_id
        WHERE wbrt.worker_name = $1 AND b.name = $2
        FOR SHARE OF wbrt
        "#,
    )
    .bind(worker_name)
    .bind(config.root_base_type())
    .fetch_optional(&mut *conn)
    .await?;

    id.ok_or_else(|| {
        FindOrCreateError::Db(DbError::BaseResourceTypeNotFound {
            worker: worker_name.to_string(),
            name: config.root_base_type().to_string(),
        })
    })
}

#[async_trait::async_trait]
impl FindOrCreate for CreateContainer<'_> {
    type Output = ContainerRow;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<ContainerRow> {
        let owner = self.resolve_owner(conn).await?;

        let sql = format!(
            r#"
            INSERT INTO containers AS c (
                handle, worker_name, state, stage, team_id,
                build_id, plan_id, resource_id, resource_config_id,
                worker_base_resource_type_id, worker_resource_cache_id,
                image_resource_type, image_resource_source_hash,
                parent_container_id, best_if_used_by, metadata
            )
            VALUES ($1, $2, 'creating', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {CONTAINER_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, ContainerRow>(&sql)
            .bind(&self.new.handle)
            .bind(&self.new.worker_name)
            .bind(self.owner.stage().as_str())
            .bind(self.new.team_id)
            .bind(owner.build_id)
            .bind(&owner.plan_id)
            .bind(owner.resource_id)
            .bind(owner.resource_config_id)
            .bind(owner.worker_base_resource_type_id)
            .bind(owner.worker_resource_cache_id)
            .bind(&owner.image_resource_type)
            .bind(&owner.image_resource_source_hash)
            .bind(owner.parent_container_id)
            .bind(self.new.best_if_used_by)
            .bind(Json(&self.new.metadata))
            .fetch_one(&mut *conn)
            .await;

        inserted.map_err(|err| classify_insert_error(err, self.new))
    }
}

/// Handle and worker violations are caller errors; a vanished owner row is a race.
fn classify_insert_error(err: sqlx::Error, new: &NewContainer) -> FindOrCreateError {
    match ConstraintViolation::classify(&err) {
        Some(ConstraintViolation::Unique { constraint }) if constraint.as_deref() == Some("containers_handle_key") => {
            FindOrCreateError::Db(DbError::HandleAlreadyExists(new.handle.clone()))
        }
        Some(ConstraintViolation::ForeignKey { constraint }) => match constraint.as_deref() {
            Some("containers_worker_name_fkey") => {
                FindOrCreateError::Db(DbError::WorkerNotPresent(new.worker_name.clone()))
            }
            Some(
                "containers_resource_config_id_fkey"
                | "containers_worker_base_resource_type_id_fkey"
                | "containers_worker_resource_cache_id_fkey",
            ) => FindOrCreateError::Retry(ConstraintViolation::ForeignKey { constraint }),
            _ => FindOrCreateError::Db(DbError::Database(err)),
        },
        Some(violation) => FindOrCreateError::Retry(violation),
        None => FindOrCreateError::Db(DbError::Database(err)),
    }
}

/// Provisioning and lookup of containers.
#[derive(Clone)]
pub struct ContainerRepository {
    pool: PgPool,
    retry: RetryPolicy,
}

impl ContainerRepository {
    /// Create a repository with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a repository with an explicit retry policy.
    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Insert a new container in state Creating.
    ///
    /// Resource owners resolve their config, the worker's base resource type
    /// and (for gets) the worker's cache row in the same transaction.
    pub async fn create(
        &self,
        identifier: &ContainerIdentifier,
        new: NewContainer,
    ) -> Result<CreatingContainer> {
        let owner = identifier.owner()?;
        let row = safe_find_or_create(
            &self.pool,
            &self.retry,
            &CreateContainer {
                owner: &owner,
                new: &new,
            },
        )
        .await?;

        match Container::from_row(&self.pool, row)? {
            Container::Creating(container) => {
                info!(
                    handle = %container.handle(),
                    worker = %container.worker_name(),
                    stage = %owner.stage(),
                    "Container created"
                );
                Ok(container)
            }
            other => Err(DbError::AlreadyTransitioned {
                handle: other.handle().to_string(),
                expected: ContainerState::Creating,
            }),
        }
    }

    /// Look up a container by handle.
    pub async fn find_by_handle(&self, handle: &str) -> Result<Option<Container>> {
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers c WHERE c.handle = $1");
        let row = sqlx::query_as::<_, ContainerRow>(&sql)
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Container::from_row(&self.pool, row))
            .transpose()
    }

    /// Look up the live (Creating or Created) container for an owner.
    ///
    /// More than one match is reported as [`DbError::MultipleContainersFound`].
    pub async fn find_by_identifier(
        &self,
        identifier: &ContainerIdentifier,
    ) -> Result<Option<Container>> {
        let owner = identifier.owner()?;
        let worker = identifier.worker_name.as_deref();

        let base = format!(
            r#"
            SELECT {CONTAINER_COLUMNS}
            FROM containers c
            WHERE c.state IN ('creating', 'created')
              AND ($1::text IS NULL OR c.worker_name = $1)
              AND c.stage = $2
            "#
        );

        let rows = match &owner {
            ContainerOwner::BuildStep {
                build_id, plan_id, ..
            } => {
                let sql = format!("{base} AND c.build_id = $3 AND c.plan_id = $4 LIMIT 2");
                sqlx::query_as::<_, ContainerRow>(&sql)
                    .bind(worker)
                    .bind(owner.stage().as_str())
                    .bind(build_id)
                    .bind(plan_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            ContainerOwner::ParentContainer {
                parent_container_id,
                ..
            } => {
                let sql = format!("{base} AND c.parent_container_id = $3 LIMIT 2");
                sqlx::query_as::<_, ContainerRow>(&sql)
                    .bind(worker)
                    .bind(owner.stage().as_str())
                    .bind(parent_container_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            ContainerOwner::Resource {
                resource_id,
                config,
                image_resource,
                resource_cache_id,
                ..
            } => {
                let mut conn = self.pool.acquire().await?;
                let Some(config_id) = resource_config::find_config_id(&mut *conn, config).await?
                else {
                    return Ok(None);
                };

                let sql = format!(
                    r#"{base}
                      AND c.resource_config_id = $3
                      AND ($4::bigint IS NULL OR c.resource_id = $4)
                      AND c.image_resource_type IS NOT DISTINCT FROM $5
                      AND c.image_resource_source_hash IS NOT DISTINCT FROM $6
                      AND ($7::bigint IS NULL OR c.worker_resource_cache_id IN (
                          SELECT id FROM worker_resource_caches WHERE resource_cache_id = $7
                      ))
                    LIMIT 2"#
                );
                sqlx::query_as::<_, ContainerRow>(&sql)
                    .bind(worker)
                    .bind(owner.stage().as_str())
                    .bind(config_id)
                    .bind(resource_id)
                    .bind(image_resource.as_ref().map(|i| i.resource_type.clone()))
                    .bind(image_resource.as_ref().map(|i| i.source_hash()))
                    .bind(resource_cache_id)
                    .fetch_all(&mut *conn)
                    .await?
            }
        };

        let mut rows = rows.into_iter();
        match (rows.next(), rows.next()) {
            (None, _) => Ok(None),
            (Some(row), None) => Container::from_row(&self.pool, row).map(Some),
            (Some(_), Some(_)) => Err(DbError::MultipleContainersFound),
        }
    }

    /// Handles of containers the worker should tear down.
    pub async fn find_destroying_containers(&self, worker_name: &str) -> Result<Vec<String>> {
        let handles = sqlx::query_scalar(
            "SELECT handle FROM containers WHERE worker_name = $1 AND state = 'destroying' ORDER BY id",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(handles)
    }

    /// Delete Destroying rows the worker no longer reports.
    ///
    /// `reported_handles` are the containers still present on the worker.
    pub async fn remove_destroying_containers(
        &self,
        worker_name: &str,
        reported_handles: &[String],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM containers
            WHERE worker_name = $1
              AND state = 'destroying'
              AND NOT (handle = ANY($2))
            "#,
        )
        .bind(worker_name)
        .bind(reported_handles)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(
                worker = %worker_name,
                removed = result.rows_affected(),
                "Removed reaped containers"
            );
        }

        Ok(result.rows_affected())
    }
}
