// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Safe find-or-create: a transaction-retry protocol.
//!
//! A body runs inside a fresh transaction. If it reports [`FindOrCreateError::Retry`]
//! (a row it meant to reuse was deleted underneath it, or a concurrent caller
//! inserted the same key first) the transaction is rolled back and the body
//! runs again after a jittered backoff. Uniqueness and foreign-key constraints
//! are the only synchronization; no lock is taken.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::error::{ConstraintViolation, DbError, Result};

/// Outcome of a single find-or-create attempt that did not succeed.
#[derive(Debug)]
pub enum FindOrCreateError {
    /// Lost a race; roll back and try again.
    Retry(ConstraintViolation),
    /// Anything else. Propagated unchanged.
    Db(DbError),
}

impl From<DbError> for FindOrCreateError {
    fn from(err: DbError) -> Self {
        Self::Db(err)
    }
}

impl From<sqlx::Error> for FindOrCreateError {
    /// Unique and foreign-key violations become retries; everything else is fatal.
    fn from(err: sqlx::Error) -> Self {
        match ConstraintViolation::classify(&err) {
            Some(violation) => Self::Retry(violation),
            None => Self::Db(DbError::Database(err)),
        }
    }
}

impl From<serde_json::Error> for FindOrCreateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(DbError::Json(err))
    }
}

/// Result type for find-or-create bodies.
pub type FindOrCreateResult<T> = std::result::Result<T, FindOrCreateError>;

/// A unit of work run under the retry protocol.
#[async_trait]
pub trait FindOrCreate: Send + Sync {
    /// Value produced on success.
    type Output: Send;

    /// Run one attempt against an open transaction.
    async fn find_or_create(&self, conn: &mut PgConnection) -> FindOrCreateResult<Self::Output>;
}

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up with [`DbError::RetriesExhausted`].
    pub max_attempts: u32,
    /// Backoff ceiling after the first lost race.
    pub base_delay: Duration,
    /// Upper bound for any single backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Ceiling for the backoff after `attempt` lost races (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// A random delay in `[0, ceiling(attempt)]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

/// Run `body` under the retry protocol and commit its result.
pub async fn safe_find_or_create<B>(pool: &PgPool, policy: &RetryPolicy, body: &B) -> Result<B::Output>
where
    B: FindOrCreate + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut tx = pool.begin().await?;

        match body.find_or_create(&mut *tx).await {
            Ok(output) => {
                tx.commit().await?;
                return Ok(output);
            }
            Err(FindOrCreateError::Retry(violation)) => {
                tx.rollback().await?;
                if attempt >= policy.max_attempts {
                    return Err(DbError::RetriesExhausted(attempt));
                }
                let delay = policy.backoff(attempt);
                debug!(
                    attempt,
                    constraint = violation.constraint().unwrap_or("unknown"),
                    delay_ms = delay.as_millis() as u64,
                    "find-or-create lost a race, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(FindOrCreateError::Db(err)) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(70),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(10));
        assert_eq!(policy.ceiling(2), Duration::from_millis(20));
        assert_eq!(policy.ceiling(3), Duration::from_millis(40));
        assert_eq!(policy.ceiling(4), Duration::from_millis(70));
        assert_eq!(policy.ceiling(40), Duration::from_millis(70));
    }

    #[test]
    fn test_backoff_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..=12 {
            assert!(policy.backoff(attempt) <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn test_zero_delay_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_non_constraint_errors_are_fatal() {
        let err = FindOrCreateError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, FindOrCreateError::Db(DbError::Database(_))));
    }
}
