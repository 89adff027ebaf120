// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-core.
//!
//! Caller-facing errors (identifier problems, worker preconditions) are
//! distinct variants. Recognized concurrency races never reach the caller:
//! they are classified here by SQLSTATE and handled where they occur.

use thiserror::Error;

use crate::container::ContainerState;

/// SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE for `foreign_key_violation`.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Result type using [`DbError`].
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors returned by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// The container identifier is underspecified or names more than one owner kind.
    #[error("invalid container identifier: {0}")]
    InvalidIdentifier(String),

    /// More than one live container matched an identifier.
    #[error("multiple containers found for identifier")]
    MultipleContainersFound,

    /// A container with this handle already exists.
    #[error("container handle '{0}' already exists")]
    HandleAlreadyExists(String),

    /// A guarded transition matched no row: another actor moved the container first.
    #[error("container '{handle}' is no longer {expected}")]
    AlreadyTransitioned {
        /// Handle of the container.
        handle: String,
        /// State the transition expected the row to be in.
        expected: ContainerState,
    },

    /// The worker row does not exist.
    #[error("worker '{0}' is not present")]
    WorkerNotPresent(String),

    /// Pruning requires the worker to be draining or stalled.
    #[error("cannot prune running worker '{0}'")]
    CannotPruneRunningWorker(String),

    /// A worker registered by one team (or globally) cannot be claimed by another.
    #[error("update of other team's worker '{0}' is not allowed")]
    UpdateOfOtherTeamsWorkerNotAllowed(String),

    /// The worker does not offer the base resource type a container needs.
    #[error("worker '{worker}' does not provide base resource type '{name}'")]
    BaseResourceTypeNotFound {
        /// Worker name.
        worker: String,
        /// Base resource type name.
        name: String,
    },

    /// A custom resource type has no pinned version yet.
    #[error("resource type '{0}' has no version")]
    UnversionedResourceType(String),

    /// The resource cache row does not exist.
    #[error("resource cache {0} not found")]
    ResourceCacheNotFound(i64),

    /// The find-or-create protocol kept losing races.
    #[error("find-or-create did not converge after {0} attempts")]
    RetriesExhausted(u32),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// Stable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::MultipleContainersFound => "MULTIPLE_CONTAINERS_FOUND",
            Self::HandleAlreadyExists(_) => "HANDLE_ALREADY_EXISTS",
            Self::AlreadyTransitioned { .. } => "ALREADY_TRANSITIONED",
            Self::WorkerNotPresent(_) => "WORKER_NOT_PRESENT",
            Self::CannotPruneRunningWorker(_) => "CANNOT_PRUNE_RUNNING_WORKER",
            Self::UpdateOfOtherTeamsWorkerNotAllowed(_) => "UPDATE_OF_OTHER_TEAMS_WORKER",
            Self::BaseResourceTypeNotFound { .. } => "BASE_RESOURCE_TYPE_NOT_FOUND",
            Self::UnversionedResourceType(_) => "UNVERSIONED_RESOURCE_TYPE",
            Self::ResourceCacheNotFound(_) => "RESOURCE_CACHE_NOT_FOUND",
            Self::RetriesExhausted(_) => "RETRIES_EXHAUSTED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

/// A constraint violation recognized as a concurrency race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// `23505`: someone inserted the same key first.
    Unique {
        /// Violated constraint, when reported.
        constraint: Option<String>,
    },
    /// `23503`: a referenced row vanished, or a referencing row appeared.
    ForeignKey {
        /// Violated constraint, when reported.
        constraint: Option<String>,
    },
}

impl ConstraintViolation {
    /// Classify a sqlx error. Returns `None` for anything that is not a
    /// unique or foreign-key violation.
    pub fn classify(err: &sqlx::Error) -> Option<Self> {
        let sqlx::Error::Database(db_err) = err else {
            return None;
        };
        let constraint = db_err.constraint().map(str::to_string);
        match db_err.code().as_deref() {
            Some(UNIQUE_VIOLATION) => Some(Self::Unique { constraint }),
            Some(FOREIGN_KEY_VIOLATION) => Some(Self::ForeignKey { constraint }),
            _ => None,
        }
    }

    /// Name of the violated constraint, if the server reported one.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Unique { constraint } | Self::ForeignKey { constraint } => constraint.as_deref(),
        }
    }
}
