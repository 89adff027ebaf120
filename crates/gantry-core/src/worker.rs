// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker registry.
//!
//! Workers register themselves with [`WorkerFactory::save_worker`] and stay
//! alive through [`WorkerFactory::heartbeat_worker`]. A heartbeat extends
//! `expires`; a running worker whose `expires` has passed is reported as
//! [`WorkerState::Stalled`] with no addresses on every read, before the
//! stall sweep has flipped the stored state.
//!
//! ```text
//!            land            sweep
//!   Running ──────► Landing ──────► Landed
//!      │  ▲
//!      │  └─── heartbeat (from Stalled)
//!      │ retire          sweep
//!      ├──────► Retiring ──────► (deleted)
//!      │ expires < NOW()
//!      └──────► Stalled
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use crate::error::{ConstraintViolation, DbError, Result};
use crate::find_or_create::{
    FindOrCreate, FindOrCreateError, FindOrCreateResult, RetryPolicy, safe_find_or_create,
};
use crate::resource_config;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Accepting work.
    Running,
    /// Draining gracefully; waits for every unfinished build.
    Landing,
    /// Drained. Kept for re-registration.
    Landed,
    /// Draining for removal; waits only for non-interruptible builds.
    Retiring,
    /// Missed its heartbeat deadline.
    Stalled,
}

impl WorkerState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Landing => "landing",
            Self::Landed => "landed",
            Self::Retiring => "retiring",
            Self::Stalled => "stalled",
        }
    }

    /// Whether address fields are meaningful in this state.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Running | Self::Landing | Self::Retiring)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "landing" => Ok(Self::Landing),
            "landed" => Ok(Self::Landed),
            "retiring" => Ok(Self::Retiring),
            "stalled" => Ok(Self::Stalled),
            other => Err(format!("unknown worker state '{}'", other)),
        }
    }
}

/// A base resource type a worker provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    /// Base type name, e.g. `git`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Rootfs image for the type.
    pub image: String,
    /// Version of the type's implementation.
    pub version: String,
}

/// What a worker reports about itself when registering or heartbeating.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Unique worker name.
    pub name: String,
    /// Requested state. Usually [`WorkerState::Running`].
    pub state: WorkerState,
    /// Container API address.
    pub addr: Option<String>,
    /// Volume API address.
    pub volume_url: Option<String>,
    /// HTTP proxy.
    pub http_proxy_url: Option<String>,
    /// HTTPS proxy.
    pub https_proxy_url: Option<String>,
    /// No-proxy list.
    pub no_proxy: Option<String>,
    /// Containers currently running on the worker.
    pub active_containers: i32,
    /// Base resource types offered.
    pub resource_types: Vec<WorkerResourceType>,
    /// Platform, e.g. `linux`.
    pub platform: String,
    /// Scheduling tags.
    pub tags: Vec<String>,
    /// Owning team. `None` means shared by all teams.
    pub team_id: Option<i64>,
    /// Unix time the worker process started.
    pub start_time: i64,
}

impl WorkerInfo {
    /// A running linux worker reachable at `addr`.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: WorkerState::Running,
            addr: Some(addr.into()),
            volume_url: None,
            http_proxy_url: None,
            https_proxy_url: None,
            no_proxy: None,
            active_containers: 0,
            resource_types: Vec::new(),
            platform: "linux".to_string(),
            tags: Vec::new(),
            team_id: None,
            start_time: 0,
        }
    }
}

/// A worker row as seen at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    /// Unique name.
    pub name: String,
    /// Effective state.
    pub state: WorkerState,
    /// Container API address. `None` when unreachable.
    pub addr: Option<String>,
    /// Volume API address. `None` when unreachable.
    pub volume_url: Option<String>,
    /// HTTP proxy.
    pub http_proxy_url: Option<String>,
    /// HTTPS proxy.
    pub https_proxy_url: Option<String>,
    /// No-proxy list.
    pub no_proxy: Option<String>,
    /// Reported active containers.
    pub active_containers: i32,
    /// Base resource types offered.
    pub resource_types: Vec<WorkerResourceType>,
    /// Platform.
    pub platform: String,
    /// Tags.
    pub tags: Vec<String>,
    /// Owning team.
    pub team_id: Option<i64>,
    /// Unix start time.
    pub start_time: i64,
    /// Heartbeat deadline. `None` never expires.
    pub expires: Option<DateTime<Utc>>,
}

// A running worker past its deadline reads as stalled with no addresses.
const WORKER_COLUMNS: &str = r#"
    w.name,
    CASE WHEN w.state = 'running' AND w.expires < NOW() THEN 'stalled' ELSE w.state END AS state,
    CASE WHEN w.state = 'running' AND w.expires < NOW() THEN NULL ELSE w.addr END AS addr,
    CASE WHEN w.state = 'running' AND w.expires < NOW() THEN NULL ELSE w.volume_url END AS volume_url,
    w.http_proxy_url, w.https_proxy_url, w.no_proxy, w.active_containers,
    w.resource_types, w.platform, w.tags, w.team_id, w.start_time, w.expires
"#;

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    name: String,
    state: String,
    addr: Option<String>,
    volume_url: Option<String>,
    http_proxy_url: Option<String>,
    https_proxy_url: Option<String>,
    no_proxy: Option<String>,
    active_containers: i32,
    resource_types: Json<Vec<WorkerResourceType>>,
    platform: String,
    tags: Json<Vec<String>>,
    team_id: Option<i64>,
    start_time: i64,
    expires: Option<DateTime<Utc>>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> Result<Self> {
        let state = WorkerState::from_str(&row.state)
            .map_err(|msg| DbError::Database(sqlx::Error::Decode(msg.into())))?;
        Ok(Self {
            name: row.name,
            state,
            addr: row.addr,
            volume_url: row.volume_url,
            http_proxy_url: row.http_proxy_url,
            https_proxy_url: row.https_proxy_url,
            no_proxy: row.no_proxy,
            active_containers: row.active_containers,
            resource_types: row.resource_types.0,
            platform: row.platform,
            tags: row.tags.0,
            team_id: row.team_id,
            start_time: row.start_time,
            expires: row.expires,
        })
    }
}

/// Seconds until expiry, or `None` for a worker that never expires.
fn ttl_secs(ttl: Duration) -> Option<f64> {
    if ttl.is_zero() {
        None
    } else {
        Some(ttl.as_secs_f64())
    }
}

struct SaveWorker<'a> {
    info: &'a WorkerInfo,
    ttl: Option<f64>,
}

impl SaveWorker<'_> {
    async fn upsert(&self, conn: &mut PgConnection) -> FindOrCreateResult<()> {
        let info = self.info;
        let (addr, volume_url) = if info.state.is_reachable() {
            (info.addr.as_deref(), info.volume_url.as_deref())
        } else {
            (None, None)
        };

        // The conflict arm only fires for the same team; a mismatch returns no row.
        let saved: std::result::Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO workers (
                name, state, addr, volume_url, http_proxy_url, https_proxy_url, no_proxy,
                active_containers, resource_types, platform, tags, team_id, start_time, expires
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                CASE WHEN $14::float8 IS NULL THEN NULL ELSE NOW() + make_interval(secs => $14::float8) END
            )
            ON CONFLICT (name) DO UPDATE SET
                state = EXCLUDED.state,
                addr = EXCLUDED.addr,
                volume_url = EXCLUDED.volume_url,
                http_proxy_url = EXCLUDED.http_proxy_url,
                https_proxy_url = EXCLUDED.https_proxy_url,
                no_proxy = EXCLUDED.no_proxy,
                active_containers = EXCLUDED.active_containers,
                resource_types = EXCLUDED.resource_types,
                platform = EXCLUDED.platform,
                tags = EXCLUDED.tags,
                start_time = EXCLUDED.start_time,
                expires = EXCLUDED.expires
            WHERE workers.team_id IS NOT DISTINCT FROM EXCLUDED.team_id
            RETURNING name
            "#,
        )
        .bind(&info.name)
        .bind(info.state.as_str())
        .bind(addr)
        .bind(volume_url)
        .bind(&info.http_proxy_url)
        .bind(&info.https_proxy_url)
        .bind(&info.no_proxy)
        .bind(info.active_containers)
        .bind(Json(&info.resource_types))
        .bind(&info.platform)
        .bind(Json(&info.tags))
        .bind(info.team_id)
        .bind(info.start_time)
        .bind(self.ttl)
        .fetch_optional(&mut *conn)
        .await;

        match saved {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(DbError::UpdateOfOtherTeamsWorkerNotAllowed(info.name.clone()).into()),
            Err(err) => match ConstraintViolation::classify(&err) {
                Some(ConstraintViolation::ForeignKey { .. }) => {
                    Err(FindOrCreateError::Db(DbError::Database(err)))
                }
                _ => Err(err.into()),
            },
        }
    }

    /// Make `worker_base_resource_types` match the reported types.
    ///
    /// A changed image or version replaces the row, so containers bound to
    /// the old row lose their base type and become collectable.
    async fn sync_base_resource_types(&self, conn: &mut PgConnection) -> FindOrCreateResult<()> {
        let mut reported = Vec::with_capacity(self.info.resource_types.len());
        let mut seen = HashSet::new();

        for rt in &self.info.resource_types {
            if !seen.insert(rt.resource_type.as_str()) {
                continue;
            }
            let base_type_id =
                resource_config::find_or_create_base_type(conn, &rt.resource_type).await?;
            reported.push(base_type_id);

            let existing: Option<(i64, String, String)> = sqlx::query_as(
                r#"
                SELECT id, image, version
                FROM worker_base_resource_types
                WHERE worker_name = $1 AND base_resource_type_id = $2
                FOR UPDATE
                "#,
            )
            .bind(&self.info.name)
            .bind(base_type_id)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some((id, image, version)) = existing {
                if image == rt.image && version == rt.version {
                    continue;
                }
                sqlx::query("DELETE FROM worker_base_resource_types WHERE id = $1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                debug!(
                    worker = %self.info.name,
                    resource_type = %rt.resource_type,
                    old_version = %version,
                    new_version = %rt.version,
                    "Replacing worker base resource type"
                );
            }

            sqlx::query(
                r#"
                INSERT INTO worker_base_resource_types (worker_name, base_resource_type_id, image, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&self.info.name)
            .bind(base_type_id)
            .bind(&rt.image)
            .bind(&rt.version)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM worker_base_resource_types
            WHERE worker_name = $1 AND NOT (base_resource_type_id = ANY($2))
            "#,
        )
        .bind(&self.info.name)
        .bind(&reported)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl FindOrCreate for SaveWorker<'_> {
    type Output = Worker;

    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<Worker> {
        self.upsert(conn).await?;
        self.sync_base_resource_types(conn).await?;

        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.name = $1");
        let row = sqlx::query_as::<_, WorkerRow>(&sql)
            .bind(&self.info.name)
            .fetch_one(&mut *conn)
            .await?;

        Ok(Worker::try_from(row)?)
    }
}

/// Registration, heartbeat and operator commands for workers.
#[derive(Clone)]
pub struct WorkerFactory {
    pool: PgPool,
    retry: RetryPolicy,
}

impl WorkerFactory {
    /// Create a factory with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a factory with an explicit retry policy.
    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Register or update a worker. A zero `ttl` means the worker never expires.
    ///
    /// Fails with [`DbError::UpdateOfOtherTeamsWorkerNotAllowed`] if a worker of
    /// the same name is registered to a different team (or shared vs. team-owned).
    pub async fn save_worker(&self, info: &WorkerInfo, ttl: Duration) -> Result<Worker> {
        let worker = safe_find_or_create(
            &self.pool,
            &self.retry,
            &SaveWorker {
                info,
                ttl: ttl_secs(ttl),
            },
        )
        .await?;

        info!(
            worker = %worker.name,
            state = %worker.state,
            team_id = ?worker.team_id,
            resource_types = worker.resource_types.len(),
            "Worker saved"
        );

        Ok(worker)
    }

    /// Extend the worker's deadline and refresh its addresses.
    ///
    /// Landing, Landed and Retiring are kept; anything else becomes Running.
    pub async fn heartbeat_worker(&self, info: &WorkerInfo, ttl: Duration) -> Result<Worker> {
        let sql = format!(
            r#"
            WITH updated AS (
                UPDATE workers SET
                    state = CASE WHEN state IN ('landing', 'landed', 'retiring') THEN state ELSE 'running' END,
                    addr = CASE WHEN state = 'landed' THEN NULL ELSE $2 END,
                    volume_url = CASE WHEN state = 'landed' THEN NULL ELSE $3 END,
                    active_containers = $4,
                    expires = CASE WHEN $5::float8 IS NULL THEN NULL ELSE NOW() + make_interval(secs => $5::float8) END
                WHERE name = $1
                RETURNING *
            )
            SELECT {WORKER_COLUMNS} FROM updated w
            "#
        );

        let row = sqlx::query_as::<_, WorkerRow>(&sql)
            .bind(&info.name)
            .bind(&info.addr)
            .bind(&info.volume_url)
            .bind(info.active_containers)
            .bind(ttl_secs(ttl))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::WorkerNotPresent(info.name.clone()))?;

        let worker = Worker::try_from(row)?;
        debug!(worker = %worker.name, state = %worker.state, "Worker heartbeat");
        Ok(worker)
    }

    /// Look up a worker by name.
    pub async fn get_worker(&self, name: &str) -> Result<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.name = $1");
        let row = sqlx::query_as::<_, WorkerRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Worker::try_from).transpose()
    }

    /// All workers, ordered by name.
    pub async fn workers(&self) -> Result<Vec<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w ORDER BY w.name");
        let rows = sqlx::query_as::<_, WorkerRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    /// Workers usable by a team: its own plus shared ones.
    pub async fn workers_for_team(&self, team_id: i64) -> Result<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers w WHERE w.team_id = $1 OR w.team_id IS NULL ORDER BY w.name"
        );
        let rows = sqlx::query_as::<_, WorkerRow>(&sql)
            .bind(team_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    /// Start a graceful drain. A Landed worker stays Landed.
    pub async fn land_worker(&self, name: &str) -> Result<()> {
        self.set_draining(
            name,
            "UPDATE workers SET state = CASE WHEN state = 'landed' THEN state ELSE 'landing' END WHERE name = $1",
        )
        .await?;
        info!(worker = %name, "Worker landing");
        Ok(())
    }

    /// Start a forced drain ending in deletion.
    pub async fn retire_worker(&self, name: &str) -> Result<()> {
        self.set_draining(name, "UPDATE workers SET state = 'retiring' WHERE name = $1")
            .await?;
        info!(worker = %name, "Worker retiring");
        Ok(())
    }

    async fn set_draining(&self, name: &str, sql: &str) -> Result<()> {
        let result = sqlx::query(sql).bind(name).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::WorkerNotPresent(name.to_string()));
        }
        Ok(())
    }

    /// Remove a worker that is not live Running.
    ///
    /// A Running worker past its deadline counts as stalled and may be pruned.
    pub async fn prune_worker(&self, name: &str) -> Result<()> {
        let pruned: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM workers
            WHERE name = $1
              AND NOT (state = 'running' AND (expires IS NULL OR expires >= NOW()))
            RETURNING name
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if pruned.is_some() {
            info!(worker = %name, "Worker pruned");
            return Ok(());
        }

        let exists: Option<String> = sqlx::query_scalar("SELECT name FROM workers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Err(DbError::CannotPruneRunningWorker(name.to_string())),
            None => Err(DbError::WorkerNotPresent(name.to_string())),
        }
    }

    /// Delete a worker unconditionally. Returns false if it did not exist.
    pub async fn delete_worker(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(worker = %name, "Worker deleted");
        }
        Ok(deleted)
    }

    /// Mark a Running worker stalled now. Returns false if it was not Running.
    pub async fn stall_worker(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers SET state = 'stalled', addr = NULL, volume_url = NULL
            WHERE name = $1 AND state = 'running'
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        let stalled = result.rows_affected() > 0;
        if stalled {
            info!(worker = %name, "Worker stalled");
        }
        Ok(stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkerState::Running,
            WorkerState::Landing,
            WorkerState::Landed,
            WorkerState::Retiring,
            WorkerState::Stalled,
        ] {
            assert_eq!(state.as_str().parse::<WorkerState>(), Ok(state));
        }
        assert!("gone".parse::<WorkerState>().is_err());
    }

    #[test]
    fn test_reachable_states() {
        assert!(WorkerState::Running.is_reachable());
        assert!(WorkerState::Landing.is_reachable());
        assert!(WorkerState::Retiring.is_reachable());
        assert!(!WorkerState::Landed.is_reachable());
        assert!(!WorkerState::Stalled.is_reachable());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        assert_eq!(ttl_secs(Duration::ZERO), None);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), Some(1.5));
    }

    #[test]
    fn test_resource_type_serializes_type_field() {
        let rt = WorkerResourceType {
            resource_type: "git".into(),
            image: "/images/git".into(),
            version: "1.0".into(),
        };
        let value = serde_json::to_value(&rt).unwrap();
        assert_eq!(value["type"], "git");
    }
}
