// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The collector seam driven by [`CollectorRuntime`](crate::runtime::CollectorRuntime).

use async_trait::async_trait;

use crate::error::Result;

/// One periodic, idempotent collection pass.
///
/// A pass computes its candidate set from the current table contents and acts
/// on it. Running it twice in a row, or from two processes at once, is safe.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one pass.
    async fn run(&self) -> Result<()>;
}
