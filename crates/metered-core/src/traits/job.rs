// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seam to the asynchronous job backend behind long-running operations.

use async_trait::async_trait;

use crate::error::MeteredError;
use crate::types::{JobStatus, OperationId};

/// Reports the state of the job executing an operation's work.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn status(&self, operation_id: &OperationId) -> Result<JobStatus, MeteredError>;

    /// Stop the job from ever running again before its operation is refunded.
    ///
    /// Returns `false` when the job cannot be stopped right now (a worker
    /// holds it, or it already completed); the caller must not refund then.
    /// An operation with no job has nothing left to stop.
    async fn abandon(&self, operation_id: &OperationId) -> Result<bool, MeteredError>;
}
