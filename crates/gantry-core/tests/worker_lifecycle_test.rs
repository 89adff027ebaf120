// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for worker registration, heartbeats and lifecycle sweeps.

mod common;

use std::time::Duration;

use common::*;
use gantry_core::{BuildStatus, DbError, WorkerFactory, WorkerLifecycle, WorkerState};
use sqlx::PgPool;

fn workers(pool: &PgPool) -> WorkerFactory {
    WorkerFactory::with_retry_policy(pool.clone(), fast_retry())
}

async fn base_type_versions(pool: &PgPool, worker: &str) -> Vec<(String, String)> {
    sqlx::query_as(
        r#"
        SELECT b.name, wbrt.version
        FROM worker_base_resource_types wbrt
        JOIN base_resource_types b ON b.id = wbrt.base_resource_type_id
        WHERE wbrt.worker_name = $1
        ORDER BY b.name
        "#,
    )
    .bind(worker)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_save_worker_is_idempotent_and_syncs_types() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let name = unique("worker");
    let info = worker_info(&name, vec![resource_type("git", "1.0"), resource_type("time", "1.0")]);

    let saved = workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();
    assert_eq!(saved.state, WorkerState::Running);
    assert_eq!(saved.addr.as_deref(), Some("10.0.0.1:7777"));
    assert!(saved.expires.is_none());
    workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();

    assert_eq!(
        base_type_versions(&pool, &name).await,
        vec![("git".to_string(), "1.0".to_string()), ("time".to_string(), "1.0".to_string())]
    );

    let info = worker_info(&name, vec![resource_type("git", "2.0")]);
    let saved = workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();
    assert_eq!(saved.resource_types, info.resource_types);
    assert_eq!(
        base_type_versions(&pool, &name).await,
        vec![("git".to_string(), "2.0".to_string())]
    );
}

#[tokio::test]
async fn test_cross_team_save_is_rejected() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team_a = create_team(&pool).await;
    let team_b = create_team(&pool).await;
    let name = unique("worker");

    let mut info = worker_info(&name, vec![]);
    info.team_id = Some(team_a);
    workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();

    info.team_id = Some(team_b);
    let err = workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, DbError::UpdateOfOtherTeamsWorkerNotAllowed(n) if n == name));

    info.team_id = None;
    let err = workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, DbError::UpdateOfOtherTeamsWorkerNotAllowed(_)));

    let stored = workers(&pool).get_worker(&name).await.unwrap().unwrap();
    assert_eq!(stored.team_id, Some(team_a));
}

#[tokio::test]
async fn test_workers_for_team_includes_shared_workers() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let other_team = create_team(&pool).await;

    let own = unique("worker");
    let mut info = worker_info(&own, vec![]);
    info.team_id = Some(team);
    workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();

    let foreign = unique("worker");
    let mut info = worker_info(&foreign, vec![]);
    info.team_id = Some(other_team);
    workers(&pool).save_worker(&info, Duration::ZERO).await.unwrap();

    let shared = create_worker(&pool).await;

    let names: Vec<String> = workers(&pool)
        .workers_for_team(team)
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert!(names.contains(&own));
    assert!(names.contains(&shared.name));
    assert!(!names.contains(&foreign));

    let all: Vec<String> = workers(&pool)
        .workers()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert!(all.contains(&own) && all.contains(&foreign) && all.contains(&shared.name));
}

#[tokio::test]
async fn test_ttl_expiry_and_heartbeat_revival() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let name = unique("worker");
    let info = worker_info(&name, vec![resource_type("git", "1.0")]);

    let saved = workers(&pool)
        .save_worker(&info, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(saved.expires.is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Expired but not yet swept: reads already report it unreachable.
    let read = workers(&pool).get_worker(&name).await.unwrap().unwrap();
    assert_eq!(read.state, WorkerState::Stalled);
    assert!(read.addr.is_none());

    WorkerLifecycle::new(pool.clone())
        .stall_unresponsive_workers()
        .await
        .unwrap();
    let stalled = workers(&pool).get_worker(&name).await.unwrap().unwrap();
    assert_eq!(stalled.state, WorkerState::Stalled);
    assert!(stalled.addr.is_none());
    assert!(stalled.volume_url.is_none());

    let revived = workers(&pool)
        .heartbeat_worker(&info, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(revived.state, WorkerState::Running);
    assert_eq!(revived.addr, info.addr);
}

#[tokio::test]
async fn test_zero_ttl_never_expires() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let worker = create_worker(&pool).await;
    assert!(worker.expires.is_none());

    let stalled = WorkerLifecycle::new(pool.clone())
        .stall_unresponsive_workers()
        .await
        .unwrap();
    assert!(!stalled.contains(&worker.name));
    let read = workers(&pool).get_worker(&worker.name).await.unwrap().unwrap();
    assert_eq!(read.state, WorkerState::Running);
}

#[tokio::test]
async fn test_heartbeat_keeps_draining_states() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let worker = create_worker(&pool).await;
    let info = worker_info(&worker.name, vec![]);

    workers(&pool).land_worker(&worker.name).await.unwrap();
    let hb = workers(&pool).heartbeat_worker(&info, Duration::from_secs(30)).await.unwrap();
    assert_eq!(hb.state, WorkerState::Landing);

    workers(&pool).retire_worker(&worker.name).await.unwrap();
    let hb = workers(&pool).heartbeat_worker(&info, Duration::from_secs(30)).await.unwrap();
    assert_eq!(hb.state, WorkerState::Retiring);

    let err = workers(&pool)
        .heartbeat_worker(&worker_info(&unique("missing"), vec![]), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::WorkerNotPresent(_)));
}

#[tokio::test]
async fn test_landed_worker_is_not_revived_by_heartbeat() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let worker = create_worker(&pool).await;
    workers(&pool).land_worker(&worker.name).await.unwrap();
    let landed = WorkerLifecycle::new(pool.clone())
        .land_finished_landing_workers()
        .await
        .unwrap();
    assert!(landed.contains(&worker.name));

    let hb = workers(&pool)
        .heartbeat_worker(&worker_info(&worker.name, vec![]), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(hb.state, WorkerState::Landed);
    assert!(hb.addr.is_none());
}

#[tokio::test]
async fn test_landing_waits_for_unfinished_one_off_build() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");
    let lifecycle = WorkerLifecycle::new(pool.clone());

    let team = create_team(&pool).await;
    let build = create_build(&pool, team, None, BuildStatus::Pending, true).await;
    let worker = create_worker(&pool).await;
    create_build_container(&pool, &worker.name, build).await;

    workers(&pool).land_worker(&worker.name).await.unwrap();
    let landed = lifecycle.land_finished_landing_workers().await.unwrap();
    assert!(!landed.contains(&worker.name));
    let read = workers(&pool).get_worker(&worker.name).await.unwrap().unwrap();
    assert_eq!(read.state, WorkerState::Landing);

    update_build(&pool, build, BuildStatus::Aborted, true).await;
    let landed = lifecycle.land_finished_landing_workers().await.unwrap();
    assert!(landed.contains(&worker.name));
    let read = workers(&pool).get_worker(&worker.name).await.unwrap().unwrap();
    assert_eq!(read.state, WorkerState::Landed);
    assert!(read.addr.is_none());
    assert!(read.volume_url.is_none());
}

#[tokio::test]
async fn test_landing_waits_for_interruptible_builds_too() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let job = create_job(&pool, team, true).await;
    let build = create_build(&pool, team, Some(job), BuildStatus::Started, true).await;
    let worker = create_worker(&pool).await;
    create_build_container(&pool, &worker.name, build).await;

    workers(&pool).land_worker(&worker.name).await.unwrap();
    let landed = WorkerLifecycle::new(pool.clone())
        .land_finished_landing_workers()
        .await
        .unwrap();
    assert!(!landed.contains(&worker.name));
}

#[tokio::test]
async fn test_retiring_ignores_interruptible_builds() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let job = create_job(&pool, team, true).await;
    let build = create_build(&pool, team, Some(job), BuildStatus::Pending, true).await;
    let worker = create_worker(&pool).await;
    create_build_container(&pool, &worker.name, build).await;

    workers(&pool).retire_worker(&worker.name).await.unwrap();
    let deleted = WorkerLifecycle::new(pool.clone())
        .delete_finished_retiring_workers()
        .await
        .unwrap();
    assert!(deleted.contains(&worker.name));
    assert!(workers(&pool).get_worker(&worker.name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retiring_waits_for_non_interruptible_and_one_off_builds() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");
    let lifecycle = WorkerLifecycle::new(pool.clone());

    let team = create_team(&pool).await;
    let job = create_job(&pool, team, false).await;
    let job_build = create_build(&pool, team, Some(job), BuildStatus::Started, true).await;
    let one_off = create_build(&pool, team, None, BuildStatus::Pending, true).await;

    let worker = create_worker(&pool).await;
    create_build_container(&pool, &worker.name, job_build).await;
    create_build_container(&pool, &worker.name, one_off).await;
    workers(&pool).retire_worker(&worker.name).await.unwrap();

    assert!(!lifecycle.delete_finished_retiring_workers().await.unwrap().contains(&worker.name));

    update_build(&pool, job_build, BuildStatus::Succeeded, true).await;
    assert!(!lifecycle.delete_finished_retiring_workers().await.unwrap().contains(&worker.name));

    update_build(&pool, one_off, BuildStatus::Errored, true).await;
    assert!(lifecycle.delete_finished_retiring_workers().await.unwrap().contains(&worker.name));
}

#[tokio::test]
async fn test_prune_worker() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let worker = create_worker(&pool).await;
    let err = workers(&pool).prune_worker(&worker.name).await.unwrap_err();
    assert!(matches!(err, DbError::CannotPruneRunningWorker(n) if n == worker.name));

    workers(&pool).land_worker(&worker.name).await.unwrap();
    workers(&pool).prune_worker(&worker.name).await.unwrap();
    assert!(workers(&pool).get_worker(&worker.name).await.unwrap().is_none());

    let err = workers(&pool).prune_worker(&worker.name).await.unwrap_err();
    assert!(matches!(err, DbError::WorkerNotPresent(_)));

    let stalled = create_worker(&pool).await;
    assert!(workers(&pool).stall_worker(&stalled.name).await.unwrap());
    assert!(!workers(&pool).stall_worker(&stalled.name).await.unwrap());
    workers(&pool).prune_worker(&stalled.name).await.unwrap();
}

#[tokio::test]
async fn test_expired_running_worker_can_be_pruned() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let name = unique("worker");
    workers(&pool)
        .save_worker(&worker_info(&name, vec![]), Duration::from_millis(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    workers(&pool).prune_worker(&name).await.unwrap();
    assert!(!workers(&pool).delete_worker(&name).await.unwrap());
}

#[tokio::test]
async fn test_delete_worker_removes_its_containers() {
    skip_if_no_db!();
    let pool = test_pool().await.expect("Failed to connect to test database");

    let team = create_team(&pool).await;
    let build = create_build(&pool, team, None, BuildStatus::Started, true).await;
    let worker = create_worker(&pool).await;
    let container = create_build_container(&pool, &worker.name, build).await;

    assert!(workers(&pool).delete_worker(&worker.name).await.unwrap());
    assert!(containers(&pool)
        .find_by_handle(container.handle())
        .await
        .unwrap()
        .is_none());
}
