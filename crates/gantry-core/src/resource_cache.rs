// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource caches: a fetched version of a resource, reference-counted by use rows.
//!
//! A cache is never owned. It stays alive while any of these reference it:
//! a `resource_cache_uses` row, a `resource_configs.resource_cache_id`
//! (custom type images), a `build_image_resource_caches` row, or a
//! `next_build_inputs` row. The find, create and pin steps below always run
//! in one transaction so a fresh cache is never observably unreferenced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use crate::error::{ConstraintViolation, DbError, Result};
use crate::find_or_create::{
    FindOrCreate, FindOrCreateError, FindOrCreateResult, RetryPolicy, safe_find_or_create,
};
use crate::resource_config::{
    self, ResourceConfigDescriptor, VersionedResourceType, hash_json,
};

/// Identity of a resource cache, resolved but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCacheDescriptor {
    /// Config the version belongs to.
    pub config: ResourceConfigDescriptor,
    /// Fetched version.
    pub version: Value,
    /// Fetch params.
    pub params: Value,
}

impl ResourceCacheDescriptor {
    /// Hash of the version.
    pub fn version_hash(&self) -> String {
        hash_json(&self.version)
    }

    /// Hash of the params.
    pub fn params_hash(&self) -> String {
        hash_json(&self.params)
    }
}

/// Who holds a use row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceCacheUser {
    /// A build relying on the cache.
    Build(i64),
    /// A container session relying on the cache.
    Container(i64),
}

impl ResourceCacheUser {
    fn build_id(&self) -> Option<i64> {
        match self {
            Self::Build(id) => Some(*id),
            Self::Container(_) => None,
        }
    }

    fn container_id(&self) -> Option<i64> {
        match self {
            Self::Container(id) => Some(*id),
            Self::Build(_) => None,
        }
    }
}

/// A cache pinned by a use row.
#[derive(Debug, Clone, PartialEq)]
pub struct UsedResourceCache {
    /// Cache id.
    pub id: i64,
    /// Parent config id.
    pub resource_config_id: i64,
    /// Fetched version.
    pub version: Value,
    /// Holder of the pin.
    pub user: ResourceCacheUser,
}

/// A persisted cache row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ResourceCache {
    /// Row id.
    pub id: i64,
    /// Parent config id.
    pub resource_config_id: i64,
    /// Fetched version.
    pub version: Value,
    /// Metadata attached after the fetch, if any.
    pub metadata: Option<sqlx::types::Json<Vec<MetadataField>>>,
}

/// One metadata entry reported by a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

/// A cache materialized on a specific worker.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WorkerResourceCache {
    /// Row id.
    pub id: i64,
    /// Worker holding the volume.
    pub worker_name: String,
    /// Cache on that volume.
    pub resource_cache_id: i64,
    /// Whether the volume has been populated.
    pub initialized: bool,
}

/// Find or create the cache row for `desc`, resolving its config first.
pub(crate) async fn find_or_create_cache(
    conn: &mut PgConnection,
    desc: &ResourceCacheDescriptor,
) -> FindOrCreateResult<i64> {
    let config = resource_config::find_or_create_config(conn, &desc.config).await?;
    let version_hash = desc.version_hash();
    let params_hash = desc.params_hash();

    let existing: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM resource_caches
        WHERE resource_config_id = $1 AND version_hash = $2 AND params_hash = $3
        FOR SHARE
        "#,
    )
    .bind(config.id)
    .bind(&version_hash)
    .bind(&params_hash)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO resource_caches (resource_config_id, version, version_hash, params_hash)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(config.id)
    .bind(&desc.version)
    .bind(&version_hash)
    .bind(&params_hash)
    .fetch_one(&mut *conn)
    .await?;

    debug!(resource_cache_id = id, resource_config_id = config.id, "Created resource cache");

    Ok(id)
}

/// Look up the cache row for `desc` without creating anything.
pub(crate) async fn find_cache_id(
    conn: &mut PgConnection,
    desc: &ResourceCacheDescriptor,
) -> Result<Option<i64>> {
    let Some(config_id) = resource_config::find_config_id(conn, &desc.config).await? else {
        return Ok(None);
    };

    let id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM resource_caches
        WHERE resource_config_id = $1 AND version_hash = $2 AND params_hash = $3
        "#,
    )
    .bind(config_id)
    .bind(desc.version_hash())
    .bind(desc.params_hash())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(id)
}

/// Pin a cache for `user`. Pinning twice is a no-op.
pub(crate) async fn insert_use(
    conn: &mut PgConnection,
    cache_id: i64,
    user: ResourceCacheUser,
) -> FindOrCreateResult<()> {
    let sql = match user {
        ResourceCacheUser::Build(_) => {
            r#"
            INSERT INTO resource_cache_uses (resource_cache_id, build_id, container_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_cache_id, build_id) WHERE build_id IS NOT NULL DO NOTHING
            "#
        }
        ResourceCacheUser::Container(_) => {
            r#"
            INSERT INTO resource_cache_uses (resource_cache_id, build_id, container_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_cache_id, container_id) WHERE container_id IS NOT NULL DO NOTHING
            "#
        }
    };

    let inserted = sqlx::query(sql)
        .bind(cache_id)
        .bind(user.build_id())
        .bind(user.container_id())
        .execute(&mut *conn)
        .await;

    // A missing build or container is the caller's problem; a vanished cache is a race.
    match inserted {
        Ok(_) => Ok(()),
        Err(err) => match ConstraintViolation::classify(&err) {
            Some(ConstraintViolation::ForeignKey { constraint })
                if constraint.as_deref() != Some("resource_cache_uses_resource_cache_id_fkey") =>
            {
                Err(FindOrCreateError::Db(DbError::Database(err)))
            }
            _ => Err(err.into()),
        },
    }
}

/// Find or create the (worker, cache) row. Fails if the cache is gone.
pub(crate) async fn find_or_create_worker_resource_cache(
    conn: &mut PgConnection,
    worker_name: &str,
    resource_cache_id: i64,
) -> FindOrCreateResult<WorkerResourceCache> {
    let cache_exists: Option<i64> =
        sqlx::query_scalar("SELECT id FROM resource_caches WHERE id = $1 FOR SHARE")
            .bind(resource_cache_id)
            .fetch_optional(&mut *conn)
            .await?;

    if cache_exists.is_none() {
        return Err(DbError::ResourceCacheNotFound(resource_cache_id).into());
    }

    let existing = sqlx::query_as::<_, WorkerResourceCache>(
        r#"
        SELECT id, worker_name, resource_cache_id, initialized
        FROM worker_resource_caches
        WHERE worker_name = $1 AND resource_cache_id = $2
        FOR SHARE
        "#,
    )
    .bind(worker_name)
    .bind(resource_cache_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        return Ok(row);
    }

    let inserted = sqlx::query_as::<_, WorkerResourceCache>(
        r#"
        INSERT INTO worker_resource_caches (worker_name, resource_cache_id)
        VALUES ($1, $2)
        RETURNING id, worker_name, resource_cache_id, initialized
        "#,
    )
    .bind(worker_name)
    .bind(resource_cache_id)
    .fetch_one(&mut *conn)
    .await;

    match inserted {
        Ok(row) => Ok(row),
        Err(err) => match ConstraintViolation::classify(&err) {
            Some(ConstraintViolation::ForeignKey { constraint })
                if constraint.as_deref() == Some("worker_resource_caches_worker_name_fkey") =>
            {
                Err(DbError::WorkerNotPresent(worker_name.to_string()).into())
            }
            _ => Err(err.into()),
        },
    }
}

struct FindOrCreateUsedCache<'a> {
    desc: &'a ResourceCacheDescriptor,
    user: ResourceCacheUser,
}

#[async_trait::async_trait]
impl FindOrCreate for FindOrCreateUsedCache<'_> {
    type Output = UsedResourceCache;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<UsedResourceCache> {
        let id = find_or_create_cache(conn, self.desc).await?;
        insert_use(conn, id, self.user).await?;

        let resource_config_id: i64 =
            sqlx::query_scalar("SELECT resource_config_id FROM resource_caches WHERE id = $1")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(UsedResourceCache {
            id,
            resource_config_id,
            version: self.desc.version.clone(),
            user: self.user,
        })
    }
}

struct FindOrCreateWorkerCache<'a> {
    worker_name: &'a str,
    resource_cache_id: i64,
}

#[async_trait::async_trait]
impl FindOrCreate for FindOrCreateWorkerCache<'_> {
    type Output = WorkerResourceCache;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<WorkerResourceCache> {
        find_or_create_worker_resource_cache(conn, self.worker_name, self.resource_cache_id).await
    }
}

/// Entry point for resource cache operations.
#[derive(Clone)]
pub struct ResourceCacheFactory {
    pool: PgPool,
    retry: RetryPolicy,
}

impl ResourceCacheFactory {
    /// Create a factory with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a factory with an explicit retry policy.
    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Resolve or create the config and cache for a fetch, and pin the cache
    /// for `user`, all in one transaction.
    pub async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        resource_type: &str,
        version: Value,
        source: Value,
        params: Value,
        visible_types: &[VersionedResourceType],
    ) -> Result<UsedResourceCache> {
        let desc = ResourceCacheDescriptor {
            config: ResourceConfigDescriptor::new(resource_type, source, visible_types)?,
            version,
            params,
        };

        let used = safe_find_or_create(
            &self.pool,
            &self.retry,
            &FindOrCreateUsedCache { desc: &desc, user },
        )
        .await?;

        debug!(resource_cache_id = used.id, user = ?user, "Pinned resource cache");

        Ok(used)
    }

    /// Fetch a cache row by id.
    pub async fn resource_cache(&self, id: i64) -> Result<Option<ResourceCache>> {
        let cache = sqlx::query_as::<_, ResourceCache>(
            "SELECT id, resource_config_id, version, metadata FROM resource_caches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cache)
    }

    /// Attach fetched-version metadata. Idempotent; returns false if the cache is gone.
    pub async fn update_metadata(&self, id: i64, metadata: &[MetadataField]) -> Result<bool> {
        let result = sqlx::query("UPDATE resource_caches SET metadata = $2 WHERE id = $1")
            .bind(id)
            .bind(sqlx::types::Json(metadata))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop the pin `user` holds on a cache. Returns whether a pin existed.
    pub async fn release(&self, id: i64, user: ResourceCacheUser) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_cache_uses
            WHERE resource_cache_id = $1
              AND build_id IS NOT DISTINCT FROM $2
              AND container_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(id)
        .bind(user.build_id())
        .bind(user.container_id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that a build ran on the image held in this cache.
    pub async fn save_build_image_resource_cache(&self, build_id: i64, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_image_resource_caches (build_id, resource_cache_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(build_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Find or create the copy of a cache on a worker.
    pub async fn find_or_create_worker_resource_cache(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> Result<WorkerResourceCache> {
        safe_find_or_create(
            &self.pool,
            &self.retry,
            &FindOrCreateWorkerCache {
                worker_name,
                resource_cache_id,
            },
        )
        .await
    }

    /// Mark a worker's cache volume as populated.
    pub async fn mark_worker_resource_cache_initialized(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE worker_resource_caches SET initialized = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(worker_resource_cache_id = id, "Worker resource cache initialized");
        }

        Ok(result.rows_affected() > 0)
    }
}
