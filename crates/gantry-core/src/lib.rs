// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Core - Resource Lifecycle and Garbage Collection
//!
//! This crate is the single source of truth for ephemeral CI resources:
//! execution containers, cached resource versions and the worker nodes that
//! host them. Many independent processes (API servers, schedulers, collectors,
//! workers) coordinate through it. They share no memory; every agreement is a
//! transactional read or write against PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  ┌──────────────────────┐  ┌──────────────────────┐
//! │ API / scheduler      │  │ Worker registration  │  │ gantry-collector     │
//! │ (provision, reuse)   │  │ (save, heartbeat)    │  │ (periodic sweeps)    │
//! └──────────┬───────────┘  └──────────┬───────────┘  └──────────┬───────────┘
//!            │                         │                         │
//!            ▼                         ▼                         ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         gantry-core (this crate)                        │
//! │  ContainerRepository   ResourceCacheFactory   WorkerFactory   GcRepo    │
//! │              safe find-or-create          WorkerLifecycle               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//!                          ┌──────────────────┐
//!                          │    PostgreSQL    │
//!                          └──────────────────┘
//! ```
//!
//! There is no lock manager and no leader. Uniqueness and foreign-key
//! constraints plus state-guarded updates (`WHERE state = <prior>`) are the
//! only synchronization.
//!
//! # Container State Machine
//!
//! ```text
//!   ┌──────────┐ created() ┌─────────┐ destroying() ┌────────────┐ destroy()
//!   │ CREATING │──────────►│ CREATED │─────────────►│ DESTROYING │──────────► (deleted)
//!   └────┬─────┘           └─────────┘              └────────────┘
//!        │ failed()                                       ▲
//!        ▼                                                │
//!   ┌─────────┐              destroying()                 │
//!   │ FAILED  │───────────────────────────────────────────┘
//!   └─────────┘
//! ```
//!
//! Each state is its own type, so only legal transitions can be called. A
//! transition that loses a race reports [`DbError::AlreadyTransitioned`].
//!
//! # Operations
//!
//! | Operation | Entry point |
//! |-----------|-------------|
//! | Create container | [`ContainerRepository::create`] |
//! | Lookup by handle / owner | [`ContainerRepository::find_by_handle`], [`ContainerRepository::find_by_identifier`] |
//! | Find-or-create resource config | [`ResourceConfigFactory::find_or_create_resource_config`] |
//! | Find-or-create resource cache + use | [`ResourceCacheFactory::find_or_create_resource_cache`] |
//! | Register / heartbeat worker | [`WorkerFactory::save_worker`], [`WorkerFactory::heartbeat_worker`] |
//! | Land / retire / prune worker | [`WorkerFactory::land_worker`], [`WorkerFactory::retire_worker`], [`WorkerFactory::prune_worker`] |
//! | Orphaned / failed containers | [`GcRepository::find_orphaned_containers`], [`GcRepository::find_failed_containers`] |
//! | Unreachable resource caches | [`GcRepository::find_unreachable_resource_caches`] |
//! | Worker sweeps | [`WorkerLifecycle`] |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GANTRY_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `GANTRY_DB_MAX_CONNECTIONS` | No | `10` | Connection pool size |
//! | `GANTRY_FIND_OR_CREATE_MAX_ATTEMPTS` | No | `10` | Attempts before giving up |
//! | `GANTRY_FIND_OR_CREATE_BASE_DELAY_MS` | No | `5` | First backoff ceiling |
//! | `GANTRY_FIND_OR_CREATE_MAX_DELAY_MS` | No | `250` | Largest backoff ceiling |

#![deny(missing_docs)]

/// Build status as seen by the lifecycle queries.
pub mod build;

/// Configuration loaded from environment variables.
pub mod config;

/// Container state machine and repository.
pub mod container;

/// Error types and constraint-violation classification.
pub mod error;

/// Transaction-retry protocol for find-or-create operations.
pub mod find_or_create;

/// Garbage collection candidate queries.
pub mod gc;

/// Embedded database migrations.
pub mod migrations;

/// Container owner identifiers.
pub mod owner;

/// Resource caches, their uses and worker-local copies.
pub mod resource_cache;

/// Resource configs and resource type resolution.
pub mod resource_config;

/// Worker registry.
pub mod worker;

/// Periodic worker lifecycle sweeps.
pub mod worker_lifecycle;

pub use build::BuildStatus;
pub use config::{Config, ConfigError, DatabaseConfig};
pub use container::{
    Container, ContainerInfo, ContainerMetadata, ContainerRepository, ContainerState,
    CreatedContainer, CreatingContainer, DestroyingContainer, FailedContainer, NewContainer,
};
pub use error::{DbError, Result};
pub use find_or_create::RetryPolicy;
pub use gc::{CollectionReport, DeleteOutcome, GcRepository, OrphanedContainers};
pub use owner::{ContainerIdentifier, ContainerOwner, ContainerStage, ImageResource};
pub use resource_cache::{
    MetadataField, ResourceCache, ResourceCacheFactory, ResourceCacheUser, UsedResourceCache,
    WorkerResourceCache,
};
pub use resource_config::{ResourceConfig, ResourceConfigFactory, VersionedResourceType};
pub use worker::{Worker, WorkerFactory, WorkerInfo, WorkerResourceType, WorkerState};
pub use worker_lifecycle::WorkerLifecycle;
