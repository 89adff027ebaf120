// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry collector - periodic garbage collection and worker sweeps.
//!
//! Every pass is a stateless query over the current table contents, so any
//! number of collector processes can run against one database.
//!
//! | Collector | Default interval | Pass |
//! |-----------|------------------|------|
//! | [`ContainerCollector`] | 30s | orphaned Created → Destroying, orphaned Creating → Failed, Failed → Destroying |
//! | [`ResourceCacheCollector`] | 60s | release finished build uses, delete unreachable caches, delete unused configs |
//! | [`WorkerCollector`] | 10s | stall expired workers, land drained landing workers, delete drained retiring workers |
//!
//! Intervals come from [`CollectorConfig::from_env`]. The binary reads only
//! the connection settings, through [`gantry_core::DatabaseConfig`]. No pass
//! runs find-or-create, so the `GANTRY_FIND_OR_CREATE_*` variables are ignored.

#![deny(missing_docs)]

pub mod collector;
pub mod config;
pub mod container_collector;
pub mod error;
pub mod resource_cache_collector;
pub mod runtime;
pub mod worker_collector;

pub use collector::Collector;
pub use config::CollectorConfig;
pub use container_collector::{ContainerCollector, ContainerPass};
pub use error::{Error, Result};
pub use resource_cache_collector::{ResourceCacheCollector, ResourceCachePass};
pub use runtime::{CollectorRuntime, CollectorRuntimeBuilder, CollectorRuntimeConfig};
pub use worker_collector::{WorkerCollector, WorkerPass};
