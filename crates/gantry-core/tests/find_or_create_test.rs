// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the retry path of the find-or-create protocol.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use common::*;
use gantry_core::find_or_create::{FindOrCreate, FindOrCreateResult, safe_find_or_create};
use gantry_core::{
    BuildStatus, DbError, DeleteOutcome, GcRepository, ResourceCacheFactory, ResourceCacheUser,
};
use serde_json::json;
use sqlx::{PgConnection, PgPool};

/// Pins `stale` on early attempts and `live` afterwards. Each attempt first
/// writes a marker team so a rolled-back attempt leaves a visible gap.
struct PinCache {
    build_id: i64,
    stale: i64,
    live: i64,
    stale_attempts: u32,
    marker: String,
    attempts: AtomicU32,
}

#[async_trait]
impl FindOrCreate for PinCache {
    type Output = i64;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<i64> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        sqlx::query("INSERT INTO teams (name) VALUES ($1)")
            .bind(format!("{}-{}", self.marker, attempt))
            .execute(&mut *conn)
            .await?;

        let cache_id = if attempt <= self.stale_attempts {
            self.stale
        } else {
            self.live
        };
        let use_id = sqlx::query_scalar(
            "INSERT INTO resource_cache_uses (resource_cache_id, build_id) VALUES ($1, $2) RETURNING id",
        )
        .bind(cache_id)
        .bind(self.build_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(use_id)
    }
}

async fn cache_for(pool: &PgPool, build_id: i64) -> i64 {
    ResourceCacheFactory::with_retry_policy(pool.clone(), fast_retry())
        .find_or_create_resource_cache(
            ResourceCacheUser::Build(build_id),
            "git",
            json!({"ref": "abc"}),
            json!({"uri": unique("repo")}),
            json!({}),
            &[],
        )
        .await
        .unwrap()
        .id
}

/// A cache id whose row has been collected.
async fn collected_cache(pool: &PgPool, team: i64) -> i64 {
    let build = create_build(pool, team, None, BuildStatus::Started, true).await;
    let id = cache_for(pool, build).await;
    assert!(ResourceCacheFactory::new(pool.clone())
        .release(id, ResourceCacheUser::Build(build))
        .await
        .unwrap());

    let outcome = GcRepository::new(pool.clone())
        .delete_resource_cache(id)
        .await
        .unwrap();
    assert_ne!(outcome, DeleteOutcome::RaceDetected);
    id
}

async fn marker_count(pool: &PgPool, marker: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM teams WHERE name LIKE $1")
        .bind(format!("{}-%", marker))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_foreign_key_violation_rolls_back_and_retries() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let build = create_build(&pool, team, None, BuildStatus::Started, true).await;
    let stale = collected_cache(&pool, team).await;
    let live = cache_for(&pool, build).await;

    let body = PinCache {
        build_id: build,
        stale,
        live,
        stale_attempts: 1,
        marker: unique("marker"),
        attempts: AtomicU32::new(0),
    };

    let use_id = safe_find_or_create(&pool, &fast_retry(), &body).await.unwrap();
    assert_eq!(body.attempts.load(Ordering::SeqCst), 2);

    let pinned: i64 = sqlx::query_scalar("SELECT resource_cache_id FROM resource_cache_uses WHERE id = $1")
        .bind(use_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(pinned, live);

    // Only the committed attempt's marker survives.
    assert_eq!(marker_count(&pool, &body.marker).await, 1);
    let survivor: String = sqlx::query_scalar("SELECT name FROM teams WHERE name LIKE $1")
        .bind(format!("{}-%", body.marker))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(survivor, format!("{}-2", body.marker));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let build = create_build(&pool, team, None, BuildStatus::Started, true).await;
    let stale = collected_cache(&pool, team).await;

    let mut policy = fast_retry();
    policy.max_attempts = 3;

    let body = PinCache {
        build_id: build,
        stale,
        live: stale,
        stale_attempts: u32::MAX,
        marker: unique("marker"),
        attempts: AtomicU32::new(0),
    };

    let err = safe_find_or_create(&pool, &policy, &body).await.unwrap_err();
    assert!(matches!(err, DbError::RetriesExhausted(3)));
    assert_eq!(body.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(marker_count(&pool, &body.marker).await, 0);
}
