// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gantry-core integration tests.
//!
//! Sweeps and GC queries are global, and tests in one binary run in
//! parallel. Every fixture gets a unique name, and tests only assert on
//! rows they created.

#![allow(dead_code)]

use std::time::Duration;

use gantry_core::{
    BuildStatus, ContainerIdentifier, ContainerRepository, ContainerStage, CreatingContainer,
    NewContainer, RetryPolicy, Worker, WorkerFactory, WorkerInfo, WorkerResourceType,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Connect to the test database and apply migrations.
pub async fn test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    MIGRATOR.run(&pool).await.ok()?;
    Some(pool)
}

/// Retry policy with short delays so contention tests finish quickly.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 20,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
    }
}

/// A name no other test uses.
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub async fn create_team(pool: &PgPool) -> i64 {
    sqlx::query_scalar("INSERT INTO teams (name) VALUES ($1) RETURNING id")
        .bind(unique("team"))
        .fetch_one(pool)
        .await
        .expect("Failed to create team")
}

/// Create a job in a fresh pipeline.
pub async fn create_job(pool: &PgPool, team_id: i64, interruptible: bool) -> i64 {
    let pipeline_id: i64 =
        sqlx::query_scalar("INSERT INTO pipelines (team_id, name) VALUES ($1, $2) RETURNING id")
            .bind(team_id)
            .bind(unique("pipeline"))
            .fetch_one(pool)
            .await
            .expect("Failed to create pipeline");

    sqlx::query_scalar(
        "INSERT INTO jobs (pipeline_id, name, interruptible) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(pipeline_id)
    .bind(unique("job"))
    .bind(interruptible)
    .fetch_one(pool)
    .await
    .expect("Failed to create job")
}

/// Create a build. `job_id = None` makes a one-off build.
pub async fn create_build(
    pool: &PgPool,
    team_id: i64,
    job_id: Option<i64>,
    status: BuildStatus,
    interceptible: bool,
) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO builds (team_id, job_id, name, status, interceptible)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(team_id)
    .bind(job_id)
    .bind(unique("build"))
    .bind(status.as_str())
    .bind(interceptible)
    .fetch_one(pool)
    .await
    .expect("Failed to create build")
}

pub async fn update_build(pool: &PgPool, build_id: i64, status: BuildStatus, interceptible: bool) {
    sqlx::query("UPDATE builds SET status = $2, interceptible = $3 WHERE id = $1")
        .bind(build_id)
        .bind(status.as_str())
        .bind(interceptible)
        .execute(pool)
        .await
        .expect("Failed to update build");
}

pub fn resource_type(name: &str, version: &str) -> WorkerResourceType {
    WorkerResourceType {
        resource_type: name.to_string(),
        image: format!("/images/{}", name),
        version: version.to_string(),
    }
}

pub fn worker_info(name: &str, resource_types: Vec<WorkerResourceType>) -> WorkerInfo {
    let mut info = WorkerInfo::new(name, "10.0.0.1:7777");
    info.volume_url = Some("http://10.0.0.1:7788".to_string());
    info.resource_types = resource_types;
    info
}

/// Register a never-expiring worker offering `git` and `time`.
pub async fn create_worker(pool: &PgPool) -> Worker {
    let name = unique("worker");
    WorkerFactory::new(pool.clone())
        .save_worker(
            &worker_info(
                &name,
                vec![resource_type("git", "1.0"), resource_type("time", "1.0")],
            ),
            Duration::ZERO,
        )
        .await
        .expect("Failed to save worker")
}

pub fn containers(pool: &PgPool) -> ContainerRepository {
    ContainerRepository::with_retry_policy(pool.clone(), fast_retry())
}

/// Create a Run-stage build step container on `worker`.
pub async fn create_build_container(
    pool: &PgPool,
    worker: &str,
    build_id: i64,
) -> CreatingContainer {
    containers(pool)
        .create(
            &ContainerIdentifier::build_step(build_id, unique("plan"), ContainerStage::Run),
            NewContainer::new(worker),
        )
        .await
        .expect("Failed to create build container")
}
