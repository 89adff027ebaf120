// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sweep intervals for the collector daemon.

use std::time::Duration;

const DEFAULT_CONTAINER_GC_SECS: u64 = 30;
const DEFAULT_RESOURCE_CACHE_GC_SECS: u64 = 60;
const DEFAULT_WORKER_SWEEP_SECS: u64 = 10;

/// How often each collector runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Interval between container collection passes.
    pub container_interval: Duration,
    /// Interval between resource cache and config collection passes.
    pub resource_cache_interval: Duration,
    /// Interval between worker stall/land/retire sweeps.
    pub worker_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            container_interval: Duration::from_secs(DEFAULT_CONTAINER_GC_SECS),
            resource_cache_interval: Duration::from_secs(DEFAULT_RESOURCE_CACHE_GC_SECS),
            worker_interval: Duration::from_secs(DEFAULT_WORKER_SWEEP_SECS),
        }
    }
}

impl CollectorConfig {
    /// Load intervals from environment variables.
    ///
    /// Environment variables:
    /// - `GANTRY_CONTAINER_GC_INTERVAL_SECS` (default: 30)
    /// - `GANTRY_RESOURCE_CACHE_GC_INTERVAL_SECS` (default: 60)
    /// - `GANTRY_WORKER_SWEEP_INTERVAL_SECS` (default: 10)
    ///
    /// Missing, unparsable or zero values fall back to the default.
    pub fn from_env() -> Self {
        Self {
            container_interval: interval_from_env(
                "GANTRY_CONTAINER_GC_INTERVAL_SECS",
                DEFAULT_CONTAINER_GC_SECS,
            ),
            resource_cache_interval: interval_from_env(
                "GANTRY_RESOURCE_CACHE_GC_INTERVAL_SECS",
                DEFAULT_RESOURCE_CACHE_GC_SECS,
            ),
            worker_interval: interval_from_env(
                "GANTRY_WORKER_SWEEP_INTERVAL_SECS",
                DEFAULT_WORKER_SWEEP_SECS,
            ),
        }
    }
}

fn interval_from_env(var: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
