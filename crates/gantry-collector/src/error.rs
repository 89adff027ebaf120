// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-collector.

use thiserror::Error;

/// Result type for collector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while running a collection pass.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] gantry_core::ConfigError),

    /// Error from the persistence layer.
    #[error("Core error: {0}")]
    Core(#[from] gantry_core::DbError),

    /// Database error outside the persistence layer.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.error_code(),
            Self::Core(e) => e.error_code(),
            Self::Database(_) => "DATABASE_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}
