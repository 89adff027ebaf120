// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::find_or_create::RetryPolicy;

/// Gantry core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Retry policy for the find-or-create protocol
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `GANTRY_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `GANTRY_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `GANTRY_FIND_OR_CREATE_MAX_ATTEMPTS`: attempts before giving up (default: 10)
    /// - `GANTRY_FIND_OR_CREATE_BASE_DELAY_MS`: first backoff step (default: 5)
    /// - `GANTRY_FIND_OR_CREATE_MAX_DELAY_MS`: backoff ceiling (default: 250)
    pub fn from_env() -> Result<Self, ConfigError> {
        let DatabaseConfig {
            database_url,
            max_connections,
        } = DatabaseConfig::from_env()?;

        let max_attempts: u32 = std::env::var("GANTRY_FIND_OR_CREATE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "GANTRY_FIND_OR_CREATE_MAX_ATTEMPTS",
                "must be a positive integer",
            ))?;

        let base_delay_ms: u64 = std::env::var("GANTRY_FIND_OR_CREATE_BASE_DELAY_MS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "GANTRY_FIND_OR_CREATE_BASE_DELAY_MS",
                    "must be a number of milliseconds",
                )
            })?;

        let max_delay_ms: u64 = std::env::var("GANTRY_FIND_OR_CREATE_MAX_DELAY_MS")
            .unwrap_or_else(|_| "250".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "GANTRY_FIND_OR_CREATE_MAX_DELAY_MS",
                    "must be a number of milliseconds",
                )
            })?;

        Ok(Self {
            database_url,
            max_connections,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
            },
        })
    }
}

/// Connection settings only, for processes that never run find-or-create.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Load `GANTRY_DATABASE_URL` (required) and `GANTRY_DB_MAX_CONNECTIONS`
    /// (default: 10). The find-or-create retry variables are not read.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("GANTRY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("GANTRY_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("GANTRY_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GANTRY_DB_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

impl ConfigError {
    /// Stable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "CONFIG_MISSING",
            Self::Invalid(..) => "CONFIG_INVALID",
        }
    }
}
