// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource configs: a resource type plus its source, content-addressed.
//!
//! A config is created either by a base resource type the workers provide,
//! or, for custom resource types, by the resource cache of its parent type
//! at the pinned version. The second form is what keeps a custom type's
//! image cache reachable.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};

use crate::error::{DbError, Result};
use crate::find_or_create::{FindOrCreate, FindOrCreateResult, RetryPolicy, safe_find_or_create};
use crate::resource_cache::{self, ResourceCacheDescriptor};

pub(crate) type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// SHA-256 of the canonical (sorted-key, compact) JSON encoding.
pub fn hash_json(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A pipeline-defined resource type visible to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    /// Name steps refer to.
    pub name: String,
    /// Type this type itself runs on.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Source for fetching the type's image.
    pub source: Value,
    /// Pinned version of the type's image, once checked.
    pub version: Option<Value>,
}

/// What a config is created by.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigParent {
    /// A base resource type offered by workers.
    BaseType(String),
    /// The cache of a custom type's image.
    ResourceCache(Box<ResourceCacheDescriptor>),
}

/// Identity of a resource config, resolved but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfigDescriptor {
    /// Parent of the config.
    pub created_by: ConfigParent,
    /// Resource source.
    pub source: Value,
}

impl ResourceConfigDescriptor {
    /// Resolve `resource_type` against the visible custom types.
    ///
    /// A custom type is resolved against the remaining types only, so a type
    /// that shadows a base type of the same name terminates at the base type.
    pub fn new(
        resource_type: &str,
        source: Value,
        visible_types: &[VersionedResourceType],
    ) -> Result<Self> {
        let Some(custom) = visible_types.iter().find(|t| t.name == resource_type) else {
            return Ok(Self {
                created_by: ConfigParent::BaseType(resource_type.to_string()),
                source,
            });
        };

        let version = custom
            .version
            .clone()
            .ok_or_else(|| DbError::UnversionedResourceType(custom.name.clone()))?;

        let remaining: Vec<VersionedResourceType> = visible_types
            .iter()
            .filter(|t| t.name != resource_type)
            .cloned()
            .collect();

        let parent = ResourceCacheDescriptor {
            config: Self::new(&custom.resource_type, custom.source.clone(), &remaining)?,
            version,
            params: Value::Object(Default::default()),
        };

        Ok(Self {
            created_by: ConfigParent::ResourceCache(Box::new(parent)),
            source,
        })
    }

    /// The base resource type at the bottom of the chain.
    pub fn root_base_type(&self) -> &str {
        match &self.created_by {
            ConfigParent::BaseType(name) => name,
            ConfigParent::ResourceCache(cache) => cache.config.root_base_type(),
        }
    }

    /// Hash of the source.
    pub fn source_hash(&self) -> String {
        hash_json(&self.source)
    }
}

/// A persisted resource config.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ResourceConfig {
    /// Row id.
    pub id: i64,
    /// Set when created by a base type.
    pub base_resource_type_id: Option<i64>,
    /// Set when created by a custom type's cache.
    pub resource_cache_id: Option<i64>,
}

/// Finds or creates a base resource type row by name.
pub(crate) async fn find_or_create_base_type(
    conn: &mut PgConnection,
    name: &str,
) -> FindOrCreateResult<i64> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM base_resource_types WHERE name = $1 FOR SHARE")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id: i64 = sqlx::query_scalar("INSERT INTO base_resource_types (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;

    Ok(id)
}

/// Find or create the config row for `desc`, creating parent caches as needed.
///
/// Boxed because custom types recurse through their parent's cache.
pub(crate) fn find_or_create_config<'a>(
    conn: &'a mut PgConnection,
    desc: &'a ResourceConfigDescriptor,
) -> BoxedFuture<'a, FindOrCreateResult<ResourceConfig>> {
    Box::pin(find_or_create_config_row(conn, desc))
}

async fn find_or_create_config_row(
    conn: &mut PgConnection,
    desc: &ResourceConfigDescriptor,
) -> FindOrCreateResult<ResourceConfig> {
    let source_hash = desc.source_hash();

    let (base_type_id, parent_cache_id) = match &desc.created_by {
        ConfigParent::BaseType(name) => (Some(find_or_create_base_type(conn, name).await?), None),
        ConfigParent::ResourceCache(parent) => {
            let cache_id = resource_cache::find_or_create_cache(conn, parent).await?;
            (None, Some(cache_id))
        }
    };

    let existing = sqlx::query_as::<_, ResourceConfig>(
        r#"
        SELECT id, base_resource_type_id, resource_cache_id
        FROM resource_configs
        WHERE base_resource_type_id IS NOT DISTINCT FROM $1
          AND resource_cache_id IS NOT DISTINCT FROM $2
          AND source_hash = $3
        FOR SHARE
        "#,
    )
    .bind(base_type_id)
    .bind(parent_cache_id)
    .bind(&source_hash)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(config) = existing {
        return Ok(config);
    }

    let config = sqlx::query_as::<_, ResourceConfig>(
        r#"
        INSERT INTO resource_configs (base_resource_type_id, resource_cache_id, source_hash)
        VALUES ($1, $2, $3)
        RETURNING id, base_resource_type_id, resource_cache_id
        "#,
    )
    .bind(base_type_id)
    .bind(parent_cache_id)
    .bind(&source_hash)
    .fetch_one(&mut *conn)
    .await?;

    Ok(config)
}

/// Look up the config row for `desc` without creating anything.
pub(crate) fn find_config_id<'a>(
    conn: &'a mut PgConnection,
    desc: &'a ResourceConfigDescriptor,
) -> BoxedFuture<'a, Result<Option<i64>>> {
    Box::pin(find_config_row_id(conn, desc))
}

async fn find_config_row_id(
    conn: &mut PgConnection,
    desc: &ResourceConfigDescriptor,
) -> Result<Option<i64>> {
    let source_hash = desc.source_hash();

    let id: Option<i64> = match &desc.created_by {
        ConfigParent::BaseType(name) => {
            sqlx::query_scalar(
                r#"
                SELECT rc.id
                FROM resource_configs rc
                JOIN base_resource_types b ON b.id = rc.base_resource_type_id
                WHERE b.name = $1 AND rc.source_hash = $2
                "#,
            )
            .bind(name)
            .bind(&source_hash)
            .fetch_optional(&mut *conn)
            .await?
        }
        ConfigParent::ResourceCache(parent) => {
            let Some(cache_id) = resource_cache::find_cache_id(conn, parent).await? else {
                return Ok(None);
            };
            sqlx::query_scalar(
                "SELECT id FROM resource_configs WHERE resource_cache_id = $1 AND source_hash = $2",
            )
            .bind(cache_id)
            .bind(&source_hash)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    Ok(id)
}

struct FindOrCreateConfig<'a> {
    desc: &'a ResourceConfigDescriptor,
}

#[async_trait::async_trait]
impl FindOrCreate for FindOrCreateConfig<'_> {
    type Output = ResourceConfig;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<ResourceConfig> {
        find_or_create_config(conn, self.desc).await
    }
}

/// Entry point for resolving resource configs.
#[derive(Clone)]
pub struct ResourceConfigFactory {
    pool: PgPool,
    retry: RetryPolicy,
}

impl ResourceConfigFactory {
    /// Create a factory with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a factory with an explicit retry policy.
    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Resolve the config for a resource type and source, creating it (and any
    /// parent caches of custom types) if needed.
    pub async fn find_or_create_resource_config(
        &self,
        resource_type: &str,
        source: Value,
        visible_types: &[VersionedResourceType],
    ) -> Result<ResourceConfig> {
        let desc = ResourceConfigDescriptor::new(resource_type, source, visible_types)?;
        safe_find_or_create(&self.pool, &self.retry, &FindOrCreateConfig { desc: &desc }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn custom(name: &str, parent: &str, version: Option<Value>) -> VersionedResourceType {
        VersionedResourceType {
            name: name.to_string(),
            resource_type: parent.to_string(),
            source: json!({"repository": format!("registry/{}", name)}),
            version,
        }
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"uri": "https://example.com/repo.git", "branch": "main"});
        let b = json!({"branch": "main", "uri": "https://example.com/repo.git"});
        assert_eq!(hash_json(&a), hash_json(&b));
        assert_ne!(hash_json(&a), hash_json(&json!({"branch": "dev"})));
        assert_eq!(hash_json(&a).len(), 64);
    }

    #[test]
    fn test_base_type_resolution() {
        let desc = ResourceConfigDescriptor::new("git", json!({"uri": "x"}), &[]).unwrap();
        assert_eq!(desc.created_by, ConfigParent::BaseType("git".into()));
        assert_eq!(desc.root_base_type(), "git");
    }

    #[test]
    fn test_custom_type_resolves_through_parent_cache() {
        let visible = vec![
            custom("slack", "image-fetcher", Some(json!({"digest": "sha256:1"}))),
            custom("image-fetcher", "registry-image", Some(json!({"digest": "sha256:2"}))),
        ];
        let desc = ResourceConfigDescriptor::new("slack", json!({"channel": "#ci"}), &visible).unwrap();

        let ConfigParent::ResourceCache(parent) = &desc.created_by else {
            panic!("expected custom type to be created by a cache");
        };
        assert_eq!(parent.version, json!({"digest": "sha256:1"}));
        let ConfigParent::ResourceCache(grandparent) = &parent.config.created_by else {
            panic!("expected nested custom type");
        };
        assert_eq!(
            grandparent.config.created_by,
            ConfigParent::BaseType("registry-image".into())
        );
        assert_eq!(desc.root_base_type(), "registry-image");
    }

    #[test]
    fn test_type_shadowing_its_own_name_terminates() {
        let visible = vec![custom("git", "git", Some(json!({"ref": "abc"})))];
        let desc = ResourceConfigDescriptor::new("git", json!({}), &visible).unwrap();
        assert_eq!(desc.root_base_type(), "git");
        assert!(matches!(desc.created_by, ConfigParent::ResourceCache(_)));
    }

    #[test]
    fn test_unversioned_custom_type_is_an_error() {
        let visible = vec![custom("slack", "registry-image", None)];
        let err = ResourceConfigDescriptor::new("slack", json!({}), &visible).unwrap_err();
        assert!(matches!(err, DbError::UnversionedResourceType(name) if name == "slack"));
    }
}
