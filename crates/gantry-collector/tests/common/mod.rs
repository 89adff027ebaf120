// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gantry-collector integration tests.
//!
//! Passes are global and tests run in parallel, so assertions only look at
//! rows the test created.

#![allow(dead_code)]

use std::time::Duration;

use gantry_core::{
    BuildStatus, ContainerIdentifier, ContainerRepository, ContainerStage, ContainerState,
    CreatingContainer, NewContainer, Worker, WorkerFactory, WorkerInfo, WorkerResourceType,
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

/// Connect to the test database and apply migrations.
pub async fn test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    gantry_core::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

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

/// Create a one-off build.
pub async fn create_build(pool: &PgPool, team_id: i64, status: BuildStatus, interceptible: bool) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO builds (team_id, name, status, interceptible) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(team_id)
    .bind(unique("build"))
    .bind(status.as_str())
    .bind(interceptible)
    .fetch_one(pool)
    .await
    .expect("Failed to create build")
}

pub async fn finish_build(pool: &PgPool, build_id: i64) {
    sqlx::query("UPDATE builds SET status = $2, interceptible = false WHERE id = $1")
        .bind(build_id)
        .bind(BuildStatus::Succeeded.as_str())
        .execute(pool)
        .await
        .expect("Failed to update build");
}

/// Register a worker whose heartbeat is due in an hour.
pub async fn create_worker(pool: &PgPool) -> Worker {
    let mut info = WorkerInfo::new(unique("worker"), "10.0.0.2:7777");
    info.resource_types = vec![WorkerResourceType {
        resource_type: "git".into(),
        image: "/images/git".into(),
        version: "1.0".into(),
    }];
    WorkerFactory::new(pool.clone())
        .save_worker(&info, Duration::from_secs(3600))
        .await
        .expect("Failed to save worker")
}

/// Push a worker's heartbeat deadline into the past.
pub async fn expire_worker(pool: &PgPool, name: &str) {
    sqlx::query("UPDATE workers SET expires = NOW() - INTERVAL '1 minute' WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .expect("Failed to expire worker");
}

pub async fn create_build_container(pool: &PgPool, worker: &str, build_id: i64) -> CreatingContainer {
    ContainerRepository::new(pool.clone())
        .create(
            &ContainerIdentifier::build_step(build_id, unique("plan"), ContainerStage::Run),
            NewContainer::new(worker),
        )
        .await
        .expect("Failed to create build container")
}

/// Current state of a container, or `None` once its row is gone.
pub async fn container_state(pool: &PgPool, handle: &str) -> Option<ContainerState> {
    ContainerRepository::new(pool.clone())
        .find_by_handle(handle)
        .await
        .expect("Failed to look up container")
        .map(|c| c.state())
}
