// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build status as seen by this layer.
//!
//! Builds belong to the scheduler. Only two facts matter here: whether a
//! build is still unfinished, and whether it can still be intercepted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a build row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Scheduled, not yet running.
    Pending,
    /// Running.
    Started,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failing step.
    Failed,
    /// Finished with an infrastructure error.
    Errored,
    /// Cancelled.
    Aborted,
}

impl BuildStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [BuildStatus; 6] = [
        Self::Pending,
        Self::Started,
        Self::Succeeded,
        Self::Failed,
        Self::Errored,
        Self::Aborted,
    ];

    /// Database values of the unfinished statuses, for `status = ANY($n)` binds.
    pub fn unfinished() -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|status| status.is_unfinished())
            .map(BuildStatus::as_str)
            .collect()
    }

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }

    /// True for pending and started builds.
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown build status '{}'", other)),
        }
    }
}
